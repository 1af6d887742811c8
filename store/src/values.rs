//! Construction of identifier and payload values from raw bytes.
//!
//! The store only ever sees these values as opaque, comparable bytes. A
//! [`ValueFactory`] owns whatever format rules the surrounding service puts
//! on them; the SQL engine runs every persisted value back through one.

use crate::error::Result;
use crate::error::StoreError;
use crate::types::Body;
use crate::types::Category;
use crate::types::DeviceId;
use crate::types::MsgId;
use crate::types::Uid;

pub trait ValueFactory: Send + Sync + std::fmt::Debug {
    fn make_uid(&self, bytes: &[u8]) -> Result<Uid>;
    fn make_msg_id(&self, bytes: &[u8]) -> Result<MsgId>;
    fn make_device_id(&self, bytes: &[u8]) -> Result<DeviceId>;
    fn make_category(&self, s: &str) -> Result<Category>;
    fn make_body(&self, bytes: &[u8]) -> Result<Body>;
}

/// Accepts any non-empty identifier, optionally of one fixed width.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueValues {
    id_width: Option<usize>,
}

impl OpaqueValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixed_width(width: usize) -> Self {
        Self {
            id_width: Some(width),
        }
    }

    fn check_id(&self, field: &'static str, bytes: &[u8]) -> Result<Vec<u8>> {
        if bytes.is_empty() {
            return Err(StoreError::decode(field, "empty identifier"));
        }
        if let Some(width) = self.id_width
            && bytes.len() != width
        {
            let got = bytes.len();
            return Err(StoreError::decode(
                field,
                format!("expected {width} bytes, got {got}"),
            ));
        }
        Ok(bytes.to_vec())
    }
}

impl ValueFactory for OpaqueValues {
    fn make_uid(&self, bytes: &[u8]) -> Result<Uid> {
        self.check_id("uid", bytes).map(Uid::from_bytes)
    }

    fn make_msg_id(&self, bytes: &[u8]) -> Result<MsgId> {
        self.check_id("msgid", bytes).map(MsgId::from_bytes)
    }

    fn make_device_id(&self, bytes: &[u8]) -> Result<DeviceId> {
        self.check_id("devid", bytes).map(DeviceId::from_bytes)
    }

    fn make_category(&self, s: &str) -> Result<Category> {
        Ok(Category::new(s))
    }

    fn make_body(&self, bytes: &[u8]) -> Result<Body> {
        Ok(Body::from_bytes(bytes))
    }
}

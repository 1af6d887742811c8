//! JSON-lines snapshots of a [`State`], one item per line. A snapshot read
//! back can seed an ephemeral engine through `init_state`.

use crate::error::Result;
use crate::types::Item;
use crate::types::State;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;

/// Write every item of `state`; returns the number of lines written.
pub fn write_state_jsonl(state: &State, out: &mut dyn Write) -> Result<usize> {
    for item in state.items() {
        serde_json::to_writer(&mut *out, item)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(state.len())
}

/// Read a snapshot. Blank lines are skipped; any other line that is not an
/// item is an error.
pub fn read_state_jsonl(input: &mut dyn std::io::Read) -> Result<State> {
    let mut items = Vec::new();
    for line in BufReader::new(input).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        items.push(serde_json::from_str::<Item>(line)?);
    }
    Ok(State::new(items))
}

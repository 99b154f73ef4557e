//! Task id pack/unpack codec.
//!
//! A task id is a lowercase hex string encoding `(request_id, kind)`
//! where the low hex nibble discriminates a summary (`0`) from run 1
//! (`1`) or run 2 (`2`).

use crate::error::SwarmError;
use crate::model::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskIdKind {
    Summary,
    Run(u8),
}

pub fn pack_summary(request_id: RequestId) -> String {
    pack(request_id, 0)
}

pub fn pack_run(request_id: RequestId, try_number: u8) -> Result<String, SwarmError> {
    if try_number != 1 && try_number != 2 {
        return Err(SwarmError::InvalidArgument(format!(
            "try_number must be 1 or 2, got {try_number}"
        )));
    }
    Ok(pack(request_id, try_number))
}

fn pack(request_id: RequestId, tag: u8) -> String {
    format!("{:015x}{:x}", request_id, tag)
}

pub fn unpack(task_id: &str) -> Result<(RequestId, TaskIdKind, u8), SwarmError> {
    if task_id.len() != 16 || !task_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SwarmError::InvalidId(task_id.to_string()));
    }
    let request_id = u64::from_str_radix(&task_id[..15], 16)
        .map_err(|_| SwarmError::InvalidId(task_id.to_string()))?;
    let tag = u8::from_str_radix(&task_id[15..], 16)
        .map_err(|_| SwarmError::InvalidId(task_id.to_string()))?;

    match tag {
        0 => Ok((request_id, TaskIdKind::Summary, 0)),
        1 | 2 => Ok((request_id, TaskIdKind::Run(tag), tag)),
        _ => Err(SwarmError::InvalidId(task_id.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_round_trip() {
        let id = 0x1234_5678_9abc;
        let packed = pack_summary(id);
        assert_eq!(unpack(&packed).unwrap(), (id, TaskIdKind::Summary, 0));
    }

    #[test]
    fn run_round_trip_for_both_tries() {
        let id = 42;
        for try_number in [1u8, 2u8] {
            let packed = pack_run(id, try_number).unwrap();
            assert_eq!(
                unpack(&packed).unwrap(),
                (id, TaskIdKind::Run(try_number), try_number)
            );
        }
    }

    #[test]
    fn rejects_bad_try_number() {
        assert!(pack_run(1, 3).is_err());
        assert!(pack_run(1, 0).is_err());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(unpack("not-hex").is_err());
        assert!(unpack("abc").is_err());
        assert!(unpack(&"f".repeat(15).to_string()).is_err()); // too short tag missing
        assert!(unpack(&format!("{}9", "f".repeat(15))).is_err()); // tag 9 invalid
    }
}

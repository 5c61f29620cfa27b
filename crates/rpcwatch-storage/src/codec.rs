//! Encoding boundary for stored display names.
//!
//! Names are free-form on-chain strings; they are kept base64-encoded at rest
//! and never leave the adapter encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use rpcwatch_core::WatchError;

pub(crate) fn encode_name(name: &str) -> String {
    STANDARD.encode(name.as_bytes())
}

pub(crate) fn decode_name(stored: &str) -> Result<String, WatchError> {
    let bytes = STANDARD
        .decode(stored)
        .map_err(|e| WatchError::Storage(format!("stored name is not base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| WatchError::Storage(format!("stored name is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_survive_encoding() {
        for name in ["Alice", "", "validator 🚀 #1", "O'Brien; DROP TABLE"] {
            assert_eq!(decode_name(&encode_name(name)).unwrap(), name);
        }
        assert_eq!(encode_name("Bob"), "Qm9i");
    }

    #[test]
    fn garbage_is_a_storage_error() {
        assert!(matches!(decode_name("not base64!"), Err(WatchError::Storage(_))));
    }
}

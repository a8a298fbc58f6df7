//! Server discovery via `/.well-known/matrix/server`.

use serde::{Deserialize, Serialize};

/// The delegation pointer served at `/.well-known/matrix/server`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerWellKnown {
    /// The `host[:port]` that actually speaks federation for this name.
    #[serde(rename = "m.server")]
    pub server: String,
}

#[cfg(test)]
mod tests {
    use super::ServerWellKnown;

    #[test]
    fn wire_field_name() {
        let parsed: ServerWellKnown =
            serde_json::from_str(r#"{"m.server":"matrix.example.com:443"}"#).unwrap();
        assert_eq!(parsed.server, "matrix.example.com:443");
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"{"m.server":"matrix.example.com:443"}"#
        );
    }
}

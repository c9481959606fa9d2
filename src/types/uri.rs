//! Pairing URI
//!
//! `wc:{topic}@2?controller={bool}&publicKey={hex}&relay={percent-encoded json}`

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::form_urlencoded::Serializer;
use url::Url;

use super::RelayProtocolOptions;
use crate::error::Error;

const SCHEME: &str = "wc";
const VERSION: &str = "2";

/// Parsed pairing URI
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    /// Proposal topic
    pub topic: String,
    /// Proposer's hex public key
    pub public_key: String,
    /// Whether the proposer is controller
    pub controller: bool,
    /// Relay protocol
    pub relay: RelayProtocolOptions,
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let relay = serde_json::to_string(&self.relay).map_err(|_| fmt::Error)?;
        let query = Serializer::new(String::new())
            .append_pair("controller", if self.controller { "true" } else { "false" })
            .append_pair("publicKey", &self.public_key)
            .append_pair("relay", &relay)
            .finish();
        write!(f, "{SCHEME}:{}@{VERSION}?{query}", self.topic)
    }
}

impl FromStr for PairingUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |why: &str| Error::MalformedUri(format!("{why}: {s}"));

        let url = Url::parse(s).map_err(|_| malformed("not a uri"))?;
        if url.scheme() != SCHEME {
            return Err(malformed("missing scheme"));
        }
        let (topic, version) = url
            .path()
            .split_once('@')
            .ok_or_else(|| malformed("missing version"))?;
        if topic.is_empty() {
            return Err(malformed("empty topic"));
        }
        if version != VERSION {
            return Err(malformed("unsupported version"));
        }
        if url.query().is_none() {
            return Err(malformed("missing query"));
        }

        let mut params: HashMap<String, String> = HashMap::new();
        for (key, value) in url.query_pairs() {
            params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }

        let controller = match params.get("controller").map(String::as_str) {
            Some("true") => true,
            Some("false") => false,
            _ => return Err(malformed("bad controller flag")),
        };
        let public_key = params
            .remove("publicKey")
            .filter(|key| !key.is_empty())
            .ok_or_else(|| malformed("missing public key"))?;
        let relay = params.get("relay").ok_or_else(|| malformed("missing relay"))?;
        let relay: RelayProtocolOptions =
            serde_json::from_str(relay).map_err(|_| malformed("bad relay options"))?;

        Ok(PairingUri {
            topic: topic.to_string(),
            public_key,
            controller,
            relay,
        })
    }
}

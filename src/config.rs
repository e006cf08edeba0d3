//! Engine configuration
//!
//! The host process parses whatever on-disk or provider format it keeps and
//! hands the engine an already-decoded [`EngineConfig`]. Keys travel as
//! base64, the universal WireGuard convention. All validation happens here,
//! before any session work begins; a bad config never reaches the protocol
//! core.

use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::x25519;
use crate::error::ConfigError;

/// Default MTU for the virtual interface
pub const DEFAULT_MTU: u16 = 1420;

/// Default handshake-per-second budget before cookies are demanded
pub const DEFAULT_HANDSHAKE_RATE_LIMIT: u64 = 10;

/// Decode a base64 32-byte key
pub fn decode_key(value: &str, field: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field.to_string(),
    })?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| ConfigError::InvalidKeyLength { got: v.len() })
}

/// Encode a 32-byte key as base64
pub fn encode_key(key: &[u8; 32]) -> String {
    BASE64.encode(key)
}

mod base64_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode_key(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let value = String::deserialize(d)?;
        super::decode_key(&value, "key").map_err(serde::de::Error::custom)
    }
}

mod base64_key_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => s.serialize_some(&super::encode_key(key)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(value) => super::decode_key(&value, "key")
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Own Curve25519 keypair, immutable after load
pub struct StaticKeyPair {
    private: [u8; 32],
    public: [u8; 32],
}

impl Drop for StaticKeyPair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl StaticKeyPair {
    pub fn from_private(private: [u8; 32]) -> Result<Self, ConfigError> {
        let public = x25519::public_key(&private);
        if !x25519::is_valid_public_key(&public) {
            return Err(ConfigError::InvalidKey {
                field: "private_key".to_string(),
            });
        }
        Ok(Self { private, public })
    }

    pub fn generate() -> Self {
        let (private, public) = x25519::generate_keypair();
        Self { private, public }
    }

    pub fn private(&self) -> &[u8; 32] {
        &self.private
    }

    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }
}

/// One configured peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer's static public key
    #[serde(with = "base64_key")]
    pub public_key: [u8; 32],

    /// Optional pre-shared symmetric key
    #[serde(default, with = "base64_key_opt", skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<[u8; 32]>,

    /// IP prefixes this peer may source and receive traffic for
    pub allowed_ips: Vec<IpNet>,

    /// Last known endpoint, updated on roaming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,

    /// Persistent keepalive interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

/// Complete engine configuration as handed over by the host
#[derive(Serialize, Deserialize)]
pub struct EngineConfig {
    /// Own static private key
    #[serde(with = "base64_key")]
    pub private_key: [u8; 32],

    /// UDP port the datagram transport listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,

    /// Virtual interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Configured peers
    pub peers: Vec<PeerConfig>,

    /// Handshake initiations per second before cookie replies kick in
    #[serde(default = "default_rate_limit")]
    pub handshake_rate_limit: u64,
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_rate_limit() -> u64 {
    DEFAULT_HANDSHAKE_RATE_LIMIT
}

impl Drop for EngineConfig {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl EngineConfig {
    /// Validate the whole configuration; configuration-fatal errors surface
    /// here and nowhere later
    pub fn validate(&self) -> Result<StaticKeyPair, ConfigError> {
        let keypair = StaticKeyPair::from_private(self.private_key)?;

        if self.mtu < 576 || self.mtu > 65435 {
            return Err(ConfigError::InvalidMtu { mtu: self.mtu });
        }

        if self.peers.is_empty() {
            return Err(ConfigError::MissingField {
                field: "peers".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            let key = encode_key(&peer.public_key);

            if !x25519::is_valid_public_key(&peer.public_key) {
                return Err(ConfigError::InvalidKey {
                    field: format!("peer public key {key}"),
                });
            }
            if peer.public_key == *keypair.public() {
                return Err(ConfigError::InvalidKey {
                    field: format!("peer public key {key} is our own"),
                });
            }
            if !seen.insert(peer.public_key) {
                return Err(ConfigError::DuplicatePeer { key });
            }
            if peer.allowed_ips.is_empty() {
                return Err(ConfigError::NoAllowedIps { key });
            }
            if peer.persistent_keepalive == Some(0) {
                return Err(ConfigError::InvalidKeepalive { seconds: 0 });
            }
        }

        Ok(keypair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> EngineConfig {
        let (_, peer_public) = x25519::generate_keypair();
        let (private, _) = x25519::generate_keypair();
        EngineConfig {
            private_key: private,
            listen_port: Some(51820),
            mtu: DEFAULT_MTU,
            peers: vec![PeerConfig {
                public_key: peer_public,
                preshared_key: None,
                allowed_ips: vec!["10.0.0.0/24".parse().unwrap()],
                endpoint: None,
                persistent_keepalive: Some(25),
            }],
            handshake_rate_limit: DEFAULT_HANDSHAKE_RATE_LIMIT,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let config = sample_config();
        let keypair = config.validate().unwrap();
        assert_eq!(*keypair.public(), x25519::public_key(&config.private_key));
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let mut config = sample_config();
        config.peers.push(config.peers[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePeer { .. })
        ));
    }

    #[test]
    fn test_peer_without_allowed_ips_rejected() {
        let mut config = sample_config();
        config.peers[0].allowed_ips.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoAllowedIps { .. })
        ));
    }

    #[test]
    fn test_bad_mtu_rejected() {
        let mut config = sample_config();
        config.mtu = 100;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMtu { .. })));
    }

    #[test]
    fn test_zero_keepalive_rejected() {
        let mut config = sample_config();
        config.peers[0].persistent_keepalive = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidKeepalive { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        // The host hands the engine a decoded saved configuration; JSON is
        // the representative interchange form
        let config = sample_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.private_key, config.private_key);
        assert_eq!(parsed.peers.len(), 1);
        assert_eq!(parsed.peers[0].allowed_ips, config.peers[0].allowed_ips);
        assert_eq!(parsed.peers[0].persistent_keepalive, Some(25));
    }

    #[test]
    fn test_key_codec() {
        let key = [7u8; 32];
        assert_eq!(decode_key(&encode_key(&key), "k").unwrap(), key);
        assert!(decode_key("not base64!!!", "k").is_err());
        assert!(matches!(
            decode_key(&BASE64.encode([0u8; 16]), "k"),
            Err(ConfigError::InvalidKeyLength { got: 16 })
        ));
    }
}

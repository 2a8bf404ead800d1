use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

// TxId identifies a transaction envelope.
// It is the 32 byte BLAKE3 digest of the envelope's canonical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId([u8; 32]);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Format as a hex string with a prefix of the first 6 bytes
        let prefix = hex::encode(&self.0[0..6]);
        write!(f, "tx:{}", prefix)
    }
}

impl Ord for TxId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for TxId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for TxId {
    fn default() -> Self {
        TxId([0; 32])
    }
}

impl Deref for TxId {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for TxId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TxId {
    pub fn new(bytes: [u8; 32]) -> Self {
        TxId(bytes)
    }

    /// Create a TxId from a byte slice read back from storage
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(TxId(array))
    }

    /// Hash arbitrary bytes into a TxId
    pub fn digest(bytes: &[u8]) -> Self {
        TxId(*blake3::hash(bytes).as_bytes())
    }

    /// Full lowercase hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let bytes = hex::decode(value).ok()?;
        Self::from_slice(&bytes)
    }
}

/// Reference to output `index` of transaction `tx_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    pub tx_id: TxId,
    pub index: u32,
}

impl StateRef {
    pub fn new(tx_id: TxId, index: u32) -> Self {
        Self { tx_id, index }
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tx_id, self.index)
    }
}

/// Links successive versions of one logical record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineageId(Uuid);

impl LineageId {
    pub fn new() -> Self {
        LineageId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        LineageId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LineageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LineageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token identifying the holder of a set of soft-lock reservations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(Uuid);

impl LockId {
    pub fn new() -> Self {
        LockId(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        LockId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(LockId)
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{}", self.0)
    }
}

/// Generate an external reference such as `PLEDGE-3F2A9C01D4E5`
pub fn generate_reference(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("{}-{}", prefix, &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tx_id_digest_is_deterministic() {
        let a = TxId::digest(b"envelope");
        let b = TxId::digest(b"envelope");
        let c = TxId::digest(b"other envelope");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tx_id_hex_round_trip_and_display() {
        let id = TxId::digest(b"hex");
        let parsed = TxId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(parsed, id);

        let shown = id.to_string();
        assert!(shown.starts_with("tx:"));
        assert_eq!(shown.len(), 3 + 12);

        // Wrong length is rejected
        assert!(TxId::from_slice(&[1u8; 31]).is_none());
    }

    #[test]
    fn test_state_ref_ordering() {
        let tx = TxId::digest(b"ordering");
        let first = StateRef::new(tx, 0);
        let second = StateRef::new(tx, 1);

        assert!(first < second);
        assert!(second.to_string().ends_with("#1"));
    }

    #[test]
    fn test_lock_ids_are_unique() {
        let ids: HashSet<LockId> = (0..100).map(|_| LockId::new()).collect();
        assert_eq!(ids.len(), 100);

        let id = LockId::new();
        assert_eq!(LockId::from_slice(id.as_bytes()), Some(id));
    }

    #[test]
    fn test_generate_reference() {
        let reference = generate_reference("PLEDGE");
        assert!(reference.starts_with("PLEDGE-"));
        assert_eq!(reference.len(), "PLEDGE-".len() + 12);
        assert_ne!(reference, generate_reference("PLEDGE"));
    }
}

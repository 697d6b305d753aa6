//! Mutation records and the context they are applied in.

use bytes::Bytes;
use cellmaster_common::{MetaVersion, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A state change submitted to the leader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationRequest {
    /// Name of the registered method applying this mutation
    pub mutation_type: String,
    /// Method-specific payload
    pub data: Bytes,
}

impl MutationRequest {
    pub fn new(mutation_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            mutation_type: mutation_type.into(),
            data: data.into(),
        }
    }
}

/// Outcome of a committed mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutationResponse {
    /// Version the mutation was applied at
    pub version: MetaVersion,
    /// Response bytes produced by the method, if any
    pub data: Option<Bytes>,
}

/// Logged form of a mutation. Everything nondeterministic about applying a
/// mutation (randomness, wall clock) is fixed here by the leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub mutation_type: String,
    pub random_seed: u64,
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

impl MutationRecord {
    /// Stamp a request with a fresh seed and the current time.
    pub fn stamp(request: &MutationRequest) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            mutation_type: request.mutation_type.clone(),
            random_seed: rand::thread_rng().r#gen(),
            timestamp_ms,
            data: request.data.to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// State available to a method while it applies one mutation.
pub struct MutationContext {
    version: MetaVersion,
    record: MutationRecord,
    rng: StdRng,
    recovery: bool,
    response: Option<Bytes>,
}

impl MutationContext {
    pub fn new(version: MetaVersion, record: MutationRecord, recovery: bool) -> Self {
        let rng = StdRng::seed_from_u64(record.random_seed);
        Self {
            version,
            record,
            rng,
            recovery,
            response: None,
        }
    }

    /// Version this mutation is applied at.
    pub const fn version(&self) -> MetaVersion {
        self.version
    }

    pub fn mutation_type(&self) -> &str {
        &self.record.mutation_type
    }

    pub fn data(&self) -> &[u8] {
        &self.record.data
    }

    pub const fn random_seed(&self) -> u64 {
        self.record.random_seed
    }

    /// Leader wall clock at the time the mutation was stamped.
    pub const fn timestamp_ms(&self) -> u64 {
        self.record.timestamp_ms
    }

    /// Deterministic generator seeded from the record; identical on every replica.
    pub fn random_generator(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// True while replaying the log or catching up.
    pub const fn is_recovery(&self) -> bool {
        self.recovery
    }

    pub fn set_response(&mut self, data: impl Into<Bytes>) {
        self.response = Some(data.into());
    }

    pub const fn response(&self) -> Option<&Bytes> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Bytes> {
        self.response.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding() {
        let record = MutationRecord::stamp(&MutationRequest::new("Test.Method", vec![1u8, 2, 3]));
        assert_eq!(record.mutation_type, "Test.Method");
        assert!(record.timestamp_ms > 0);
        let bytes = record.to_bytes().unwrap();
        assert_eq!(MutationRecord::from_bytes(&bytes).unwrap(), record);
        assert!(MutationRecord::from_bytes(&[0xff]).is_err());
    }

    #[test]
    fn test_context_rng_is_deterministic() {
        let record = MutationRecord {
            mutation_type: "Test.Method".into(),
            random_seed: 42,
            timestamp_ms: 1,
            data: Vec::new(),
        };
        let mut a = MutationContext::new(MetaVersion::new(1, 2), record.clone(), false);
        let mut b = MutationContext::new(MetaVersion::new(1, 2), record, true);
        let xs: Vec<u32> = (0..4).map(|_| a.random_generator().r#gen()).collect();
        let ys: Vec<u32> = (0..4).map(|_| b.random_generator().r#gen()).collect();
        assert_eq!(xs, ys);
        assert!(b.is_recovery());
    }

    #[test]
    fn test_response() {
        let record = MutationRecord {
            mutation_type: "Test.Method".into(),
            random_seed: 0,
            timestamp_ms: 0,
            data: Vec::new(),
        };
        let mut context = MutationContext::new(MetaVersion::default(), record, false);
        assert!(context.response().is_none());
        context.set_response(vec![9u8]);
        assert_eq!(context.take_response(), Some(Bytes::from_static(&[9])));
        assert!(context.response().is_none());
    }
}

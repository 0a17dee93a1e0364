//! Task specifications and resource demand vectors.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::{ActorId, ObjectId, TaskId};

/// Scalar resource capacities and demands (CPU and GPU counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVector {
    /// CPU count.
    pub cpus: u64,
    /// GPU count.
    pub gpus: u64,
}

impl ResourceVector {
    /// The zero vector.
    pub const ZERO: Self = Self { cpus: 0, gpus: 0 };

    /// Construct from CPU and GPU counts.
    pub const fn new(cpus: u64, gpus: u64) -> Self {
        Self { cpus, gpus }
    }

    /// Whether this demand fits within `available`, component-wise.
    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        self.cpus <= available.cpus && self.gpus <= available.gpus
    }

    /// Component-wise subtraction; `None` if any component would go negative.
    pub fn checked_sub(&self, other: &ResourceVector) -> Option<ResourceVector> {
        Some(ResourceVector {
            cpus: self.cpus.checked_sub(other.cpus)?,
            gpus: self.gpus.checked_sub(other.gpus)?,
        })
    }

    /// Component-wise saturating addition.
    pub fn saturating_add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpus: self.cpus.saturating_add(other.cpus),
            gpus: self.gpus.saturating_add(other.gpus),
        }
    }
}

mod payload_b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&B64.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        B64.decode(raw.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Serialized body of a task spec. This is the canonical wire form; the task
/// id is recomputed from it on deserialization, never trusted from the peer.
#[derive(Clone, Serialize, Deserialize)]
struct SpecBody {
    #[serde(with = "payload_b64")]
    payload: Vec<u8>,
    args: Vec<ObjectId>,
    num_returns: u32,
    resources: ResourceVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    actor: Option<ActorId>,
}

impl SpecBody {
    fn task_id(&self) -> TaskId {
        let bytes = serde_json::to_vec(self).expect("spec body serialization cannot fail");
        TaskId::from_digest(&Sha256::digest(&bytes))
    }
}

/// Immutable descriptor of a unit of deferred computation.
///
/// The task id is a deterministic function of the spec contents, so any node
/// that holds the spec derives the same id and the same return-object ids.
/// Equality is byte-wise over the serialized body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SpecBody", into = "SpecBody")]
pub struct TaskSpec {
    id: TaskId,
    payload: Vec<u8>,
    args: Vec<ObjectId>,
    num_returns: u32,
    resources: ResourceVector,
    actor: Option<ActorId>,
}

impl TaskSpec {
    /// Build a spec and derive its content id.
    pub fn new(
        payload: Vec<u8>,
        args: Vec<ObjectId>,
        num_returns: u32,
        resources: ResourceVector,
        actor: Option<ActorId>,
    ) -> Self {
        SpecBody {
            payload,
            args,
            num_returns,
            resources,
            actor,
        }
        .into()
    }

    /// The content-derived task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Opaque payload forwarded to the executing worker.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Argument object ids, in call order.
    pub fn args(&self) -> &[ObjectId] {
        &self.args
    }

    /// Number of return values.
    pub fn num_returns(&self) -> u32 {
        self.num_returns
    }

    /// Resource demand reserved for the lifetime of the execution.
    pub fn resources(&self) -> ResourceVector {
        self.resources
    }

    /// Actor this task is bound to, if stateful.
    pub fn actor(&self) -> Option<ActorId> {
        self.actor
    }

    /// Ids of the task's return objects, in return order.
    pub fn return_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let id = self.id;
        (0..self.num_returns).map(move |k| ObjectId::for_return(id, k))
    }

    /// Canonical serialized form carried on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("spec serialization cannot fail")
    }

    /// Parse the canonical serialized form, recomputing the task id.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<SpecBody> for TaskSpec {
    fn from(body: SpecBody) -> Self {
        let id = body.task_id();
        Self {
            id,
            payload: body.payload,
            args: body.args,
            num_returns: body.num_returns,
            resources: body.resources,
            actor: body.actor,
        }
    }
}

impl From<TaskSpec> for SpecBody {
    fn from(spec: TaskSpec) -> Self {
        Self {
            payload: spec.payload,
            args: spec.args,
            num_returns: spec.num_returns,
            resources: spec.resources,
            actor: spec.actor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(payload: &[u8], args: Vec<ObjectId>) -> TaskSpec {
        TaskSpec::new(payload.to_vec(), args, 1, ResourceVector::new(1, 0), None)
    }

    #[test]
    fn task_id_is_a_function_of_contents() {
        let a = spec(b"train", vec![]);
        let b = spec(b"train", vec![]);
        let c = spec(b"eval", vec![]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());

        let arg = ObjectId::for_return(c.id(), 0);
        assert_ne!(spec(b"train", vec![arg]).id(), a.id());
    }

    #[test]
    fn wire_round_trip_preserves_identity() {
        let actor = ActorId::from_bytes([9u8; crate::ids::ID_LEN]);
        let original = TaskSpec::new(
            b"step".to_vec(),
            vec![ObjectId::from_bytes([3u8; crate::ids::ID_LEN])],
            2,
            ResourceVector::new(2, 1),
            Some(actor),
        );

        let parsed = TaskSpec::from_bytes(&original.to_bytes()).expect("parse");
        assert_eq!(parsed, original);
        assert_eq!(parsed.id(), original.id());
        assert_eq!(parsed.return_ids().count(), 2);
    }

    #[test]
    fn forged_ids_are_not_trusted_from_the_wire() {
        // Whatever a peer claims, the id is recomputed from the body.
        let original = spec(b"x", vec![]);
        let reparsed = TaskSpec::from_bytes(&original.to_bytes()).expect("parse");
        assert_eq!(reparsed.id(), original.id());
    }

    #[test]
    fn resource_arithmetic() {
        let capacity = ResourceVector::new(4, 1);
        let demand = ResourceVector::new(2, 1);
        assert!(demand.fits_within(&capacity));

        let rest = capacity.checked_sub(&demand).expect("fits");
        assert_eq!(rest, ResourceVector::new(2, 0));
        assert!(!demand.fits_within(&rest));
        assert_eq!(rest.checked_sub(&demand), None);
        assert_eq!(rest.saturating_add(&demand), capacity);
    }
}

//! Fixed-width identifiers for tasks, objects, nodes, and actors.
//!
//! All ids are 20 bytes. A task id is content-derived (see
//! [`TaskId::from_digest`]) with its trailing four bytes zeroed; the id of a
//! task's k-th return value reuses the task's 16-byte prefix and stores
//! `k + 1` little-endian in the trailing four bytes. That layout lets any
//! holder of an object id recover the producing task id without a lookup.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Width in bytes of every identifier type in this crate.
pub const ID_LEN: usize = 20;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// The all-zero id.
            pub const fn nil() -> Self {
                Self([0u8; ID_LEN])
            }

            /// Wrap raw bytes.
            pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Borrow the raw bytes.
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// Parse the lowercase-hex form produced by [`std::fmt::Display`].
            pub fn from_hex(s: &str) -> Option<Self> {
                let raw = hex::decode(s).ok()?;
                let bytes: [u8; ID_LEN] = raw.try_into().ok()?;
                Some(Self(bytes))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }
    };
}

id_type! {
    /// Identifier of a submitted task. Content-derived; the trailing four
    /// bytes are always zero so that return-object ids can share the prefix.
    TaskId
}

id_type! {
    /// Identifier of an object produced by a task.
    ObjectId
}

id_type! {
    /// Identifier of a cluster node (one local scheduler per node).
    NodeId
}

id_type! {
    /// Identifier of a stateful actor bound to a dedicated worker.
    ActorId
}

impl TaskId {
    /// Build a task id from a content digest. The first 16 digest bytes are
    /// kept and the trailing four bytes are zeroed.
    ///
    /// # Panics
    ///
    /// Panics if `digest` is shorter than 16 bytes; callers always pass a
    /// full SHA-256 digest.
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[..16].copy_from_slice(&digest[..16]);
        Self(bytes)
    }
}

impl ObjectId {
    /// The id of `task`'s `k`-th return value.
    pub fn for_return(task: TaskId, k: u32) -> Self {
        let mut bytes = *task.as_bytes();
        bytes[16..].copy_from_slice(&(k + 1).to_le_bytes());
        Self(bytes)
    }

    /// Recover the id of the task that produces this object.
    pub fn producing_task(&self) -> TaskId {
        let mut bytes = self.0;
        bytes[16..].fill(0);
        TaskId::from_bytes(bytes)
    }

    /// The return index this object occupies in its producing task, if this
    /// id was derived with [`ObjectId::for_return`].
    pub fn return_index(&self) -> Option<u32> {
        let tail = u32::from_le_bytes(self.0[16..].try_into().expect("4-byte tail"));
        tail.checked_sub(1)
    }
}

impl NodeId {
    /// Derive a node id by hashing identifying material (advertised address,
    /// socket path, pid, start time).
    pub fn derive(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest[..ID_LEN]);
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_ids_are_distinct_and_recover_the_task() {
        let task = TaskId::from_digest(&Sha256::digest(b"spec bytes"));
        let first = ObjectId::for_return(task, 0);
        let second = ObjectId::for_return(task, 1);

        assert_ne!(first, second);
        assert_eq!(first.producing_task(), task);
        assert_eq!(second.producing_task(), task);
        assert_eq!(first.return_index(), Some(0));
        assert_eq!(second.return_index(), Some(1));
    }

    #[test]
    fn task_id_tail_is_zeroed() {
        let task = TaskId::from_digest(&[0xff; 32]);
        assert_eq!(&task.as_bytes()[16..], &[0, 0, 0, 0]);
        // The task id itself never collides with a derived return id.
        assert_ne!(
            *task.as_bytes(),
            *ObjectId::for_return(task, 0).as_bytes()
        );
    }

    #[test]
    fn hex_round_trip() {
        let oid = ObjectId::from_bytes([7u8; ID_LEN]);
        let hex = oid.to_string();
        assert_eq!(hex.len(), ID_LEN * 2);
        assert_eq!(ObjectId::from_hex(&hex), Some(oid));
        assert_eq!(ObjectId::from_hex("zz"), None);
    }

    #[test]
    fn node_id_derivation_is_deterministic() {
        let a = NodeId::derive(&[b"10.0.0.1", b"/tmp/sched.sock"]);
        let b = NodeId::derive(&[b"10.0.0.1", b"/tmp/sched.sock"]);
        let c = NodeId::derive(&[b"10.0.0.2", b"/tmp/sched.sock"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

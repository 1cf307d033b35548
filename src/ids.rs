//! # Identifier Codec
//!
//! Bidirectional encoding between shard-local identifiers and globally
//! unique identifiers. A single classification function feeds every
//! operation; all sign handling takes the absolute value, performs the
//! unsigned operation, and reapplies the original sign, so negative
//! (synthetic/sentinel) ids carry shard routing information symmetrically
//! with positive ones.

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::context;
use crate::model::{Category, Shard, ShardRef};
use crate::registry::ShardRegistry;

/// Width of one shard's local id space. Ids with a smaller absolute value
/// are local to an implicit shard; everything above encodes
/// `shard = abs / IDS_PER_SHARD`, `local = abs % IDS_PER_SHARD`.
pub const IDS_PER_SHARD: i64 = 10_000_000_000_000;

/// An entity-like value that exposes a raw id field the codec can extract.
pub trait EntityRef {
    fn raw_id(&self) -> i64;
}

/// Identifier-like input: a raw integer, a numeric or composite
/// `"<shard>~<local>"` string, or an entity reference.
pub enum IdInput<'a> {
    Integer(i64),
    Text(&'a str),
    Entity(&'a dyn EntityRef),
}

impl<'a> IdInput<'a> {
    pub fn entity(entity: &'a dyn EntityRef) -> Self {
        IdInput::Entity(entity)
    }
}

impl fmt::Debug for IdInput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdInput::Integer(v) => write!(f, "{v}"),
            IdInput::Text(s) => write!(f, "{s:?}"),
            IdInput::Entity(e) => write!(f, "entity({})", e.raw_id()),
        }
    }
}

impl From<i64> for IdInput<'static> {
    fn from(value: i64) -> Self {
        IdInput::Integer(value)
    }
}

impl From<i32> for IdInput<'static> {
    fn from(value: i32) -> Self {
        IdInput::Integer(value as i64)
    }
}

impl<'a> From<&'a str> for IdInput<'a> {
    fn from(value: &'a str) -> Self {
        IdInput::Text(value)
    }
}

impl<'a> From<&'a String> for IdInput<'a> {
    fn from(value: &'a String) -> Self {
        IdInput::Text(value)
    }
}

enum Classified {
    Plain(i64),
    Composite { shard: i64, local: i64 },
    Unrecognized,
}

/// The one classification function feeding every codec operation.
fn classify(input: &IdInput<'_>) -> Classified {
    match input {
        IdInput::Integer(v) => Classified::Plain(*v),
        IdInput::Entity(e) => Classified::Plain(e.raw_id()),
        IdInput::Text(s) => {
            let s = s.trim();
            if let Ok(v) = s.parse::<i64>() {
                return Classified::Plain(v);
            }
            match s.split_once('~') {
                Some((shard, local)) => match (shard.parse::<i64>(), local.parse::<i64>()) {
                    (Ok(shard), Ok(local))
                        if shard >= 0
                            && local
                                .checked_abs()
                                .is_some_and(|abs| abs < IDS_PER_SHARD) =>
                    {
                        Classified::Composite { shard, local }
                    }
                    // A local part at or beyond the shard width is a
                    // malformed double-encoding.
                    _ => Classified::Unrecognized,
                },
                None => Classified::Unrecognized,
            }
        }
    }
}

fn integral(classified: Classified) -> Option<i64> {
    match classified {
        Classified::Plain(v) => Some(v),
        Classified::Composite { shard, local } => {
            let magnitude = shard
                .checked_mul(IDS_PER_SHARD)?
                .checked_add(local.abs())?;
            Some(if local < 0 { -magnitude } else { magnitude })
        }
        Classified::Unrecognized => None,
    }
}

/// Split an integral id into `(shard, signed local)`; shard 0 means "local
/// to an implicit shard".
fn split(value: i64) -> (i64, i64) {
    let abs = value.unsigned_abs();
    let shard = (abs / IDS_PER_SHARD as u64) as i64;
    let local = (abs % IDS_PER_SHARD as u64) as i64;
    (shard, if value < 0 { -local } else { local })
}

fn encode(shard: i64, local: i64) -> Option<i64> {
    let magnitude = shard.checked_mul(IDS_PER_SHARD)?.checked_add(local.abs())?;
    Some(if local < 0 { -magnitude } else { magnitude })
}

/// Codec over the global id space, resolving shard ownership through the
/// registry and the calling context's current shard.
pub struct IdCodec {
    registry: Arc<ShardRegistry>,
}

impl IdCodec {
    pub fn new(registry: Arc<ShardRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Normalize an identifier-like value into a signed integer, or `None`
    /// if unrecognized.
    pub fn integral_id_for<'a>(&self, value: impl Into<IdInput<'a>>) -> Option<i64> {
        integral(classify(&value.into()))
    }

    /// Decode to `(local id, owning shard)`.
    ///
    /// Ambiguously local values come back as `(value, None)`; well-formed
    /// global ids naming a nonexistent shard come back as `(None, None)`.
    /// Unrecognized input is an error: the caller demanded an integer id.
    pub fn local_id_for<'a>(
        &self,
        value: impl Into<IdInput<'a>>,
    ) -> Result<(Option<i64>, Option<ShardRef>)> {
        let input = value.into();
        let Some(value) = integral(classify(&input)) else {
            bail!("cannot interpret {input:?} as an integral id");
        };
        let (shard_id, local) = split(value);
        if shard_id == 0 {
            return Ok((Some(value), None));
        }
        match self.registry.lookup(shard_id) {
            Some(shard) => Ok((Some(local), Some(shard))),
            None => Ok((None, None)),
        }
    }

    /// Force the fully shard-qualified form; a no-op on ids that are
    /// already global.
    pub fn global_id_for<'a>(
        &self,
        value: impl Into<IdInput<'a>>,
        source: Option<&Shard>,
    ) -> Option<i64> {
        let value = integral(classify(&value.into()))?;
        let (shard_id, local) = split(value);
        if shard_id != 0 {
            return Some(value);
        }
        let owner = match source {
            Some(shard) => shard.id().0,
            None => self.current_shard().id().0,
        };
        encode(owner, local)
    }

    /// Reinterpret `value`'s local part as relative to `source` when it was
    /// ambiguous, then re-encode relative to `target`: same shard gives the
    /// bare local part, a different shard the full global form. The
    /// original integral value comes back unchanged when no local part can
    /// be determined.
    pub fn relative_id_for<'a>(
        &self,
        value: impl Into<IdInput<'a>>,
        source: Option<&Shard>,
        target: &Shard,
    ) -> Option<i64> {
        let value = integral(classify(&value.into()))?;
        let (shard_id, local) = split(value);
        let owner = if shard_id == 0 {
            match source {
                Some(shard) => shard.id().0,
                None => return Some(value),
            }
        } else {
            match self.registry.lookup(shard_id) {
                Some(shard) => shard.id().0,
                None => return Some(value),
            }
        };
        if owner == target.id().0 {
            Some(local)
        } else {
            encode(owner, local)
        }
    }

    /// Compact printable form: the local part alone when the owner is
    /// implicit or is the context's current shard, otherwise
    /// `"<shard>~<local>"`. Round-trips through [`integral_id_for`].
    ///
    /// [`integral_id_for`]: IdCodec::integral_id_for
    pub fn short_id_for<'a>(&self, value: impl Into<IdInput<'a>>) -> Option<String> {
        let value = integral(classify(&value.into()))?;
        let (shard_id, local) = split(value);
        if shard_id == 0 || self.current_shard().id().0 == shard_id {
            Some(local.to_string())
        } else {
            Some(format!("{shard_id}~{local}"))
        }
    }

    /// The shard owning `value`, defaulting to `source` and then the
    /// calling context's current shard for local/ambiguous ids.
    pub fn shard_for<'a>(
        &self,
        value: impl Into<IdInput<'a>>,
        source: Option<&ShardRef>,
    ) -> Option<ShardRef> {
        match self.local_id_for(value) {
            Err(_) => None,
            Ok((_, Some(shard))) => Some(shard),
            Ok(_) => source.cloned().or_else(|| Some(self.current_shard())),
        }
    }

    fn current_shard(&self) -> ShardRef {
        context::current(&Category::primary(), &self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServerId, ShardId, ShardRecord};
    use crate::test_support::{topology, MemoryCache, MemoryShardStore};

    struct FakeEntity {
        id: i64,
    }

    impl EntityRef for FakeEntity {
        fn raw_id(&self) -> i64 {
            self.id
        }
    }

    fn codec() -> IdCodec {
        let records = vec![
            ShardRecord::new(ShardId(1), Some(ServerId::new("primary")), true),
            ShardRecord::new(ShardId(7), Some(ServerId::new("primary")), false),
        ];
        let registry = Arc::new(ShardRegistry::new(
            Arc::new(MemoryShardStore::with_records(records)),
            Arc::new(MemoryCache::default()),
            topology(&["primary"]),
        ));
        IdCodec::new(registry)
    }

    #[test]
    fn integral_normalizes_every_input_kind() {
        let codec = codec();
        assert_eq!(codec.integral_id_for(42), Some(42));
        assert_eq!(codec.integral_id_for("42"), Some(42));
        assert_eq!(codec.integral_id_for("7~42"), Some(70_000_000_000_042));
        assert_eq!(codec.integral_id_for("7~-42"), Some(-70_000_000_000_042));
        assert_eq!(
            codec.integral_id_for(IdInput::entity(&FakeEntity { id: 42 })),
            Some(42)
        );
        assert_eq!(codec.integral_id_for("not-an-id"), None);
    }

    #[test]
    fn double_encoded_composites_are_rejected() {
        let codec = codec();
        // Local part is itself a global id.
        assert_eq!(codec.integral_id_for("7~70000000000042"), None);
        assert_eq!(codec.integral_id_for("7~10000000000000"), None);
        assert_eq!(
            codec.integral_id_for("7~9999999999999"),
            Some(79_999_999_999_999)
        );
    }

    #[test]
    fn overflowing_composites_are_rejected() {
        let codec = codec();
        assert_eq!(codec.integral_id_for("99999999999999999~1"), None);
    }

    #[test]
    fn local_id_decodes_owner() {
        let codec = codec();
        let (local, shard) = codec.local_id_for(70_000_000_000_042i64).unwrap();
        assert_eq!(local, Some(42));
        assert_eq!(shard.unwrap().id(), ShardId(7));
    }

    #[test]
    fn ambiguous_local_has_no_owner() {
        let codec = codec();
        let (local, shard) = codec.local_id_for(42).unwrap();
        assert_eq!(local, Some(42));
        assert!(shard.is_none());
    }

    #[test]
    fn unresolvable_shard_is_the_sentinel_pair() {
        let codec = codec();
        let missing = 99 * IDS_PER_SHARD + 42;
        let (local, shard) = codec.local_id_for(missing).unwrap();
        assert!(local.is_none());
        assert!(shard.is_none());
    }

    #[test]
    fn local_id_for_garbage_is_an_error() {
        let codec = codec();
        assert!(codec.local_id_for("garbage").is_err());
    }

    #[test]
    fn sign_symmetry() {
        let codec = codec();
        let shard = codec.registry().lookup(7).unwrap();
        let positive = codec.global_id_for(42, Some(shard.as_ref())).unwrap();
        let negative = codec.global_id_for(-42, Some(shard.as_ref())).unwrap();
        assert_eq!(negative, -positive);

        let (local, owner) = codec.local_id_for(negative).unwrap();
        assert_eq!(local, Some(-42));
        assert_eq!(owner.unwrap().id(), ShardId(7));
    }

    #[test]
    fn global_id_is_idempotent() {
        let codec = codec();
        let shard = codec.registry().lookup(7).unwrap();
        let global = codec.global_id_for(42, Some(shard.as_ref())).unwrap();
        assert_eq!(global, 70_000_000_000_042);
        assert_eq!(codec.global_id_for(global, Some(shard.as_ref())), Some(global));
        assert_eq!(codec.global_id_for(global, None), Some(global));
    }

    #[test]
    fn relative_id_recodes_between_shards() {
        let codec = codec();
        let one = codec.registry().lookup(1).unwrap();
        let seven = codec.registry().lookup(7).unwrap();

        // Ambiguous local reinterpreted against source, re-encoded for
        // target.
        assert_eq!(codec.relative_id_for(42, Some(seven.as_ref()), &seven), Some(42));
        assert_eq!(
            codec.relative_id_for(42, Some(seven.as_ref()), &one),
            Some(70_000_000_000_042)
        );
        // Explicit shard survives regardless of source.
        assert_eq!(
            codec.relative_id_for(70_000_000_000_042i64, Some(one.as_ref()), &seven),
            Some(42)
        );
        // Undecodable local part comes back unchanged.
        let missing = 99 * IDS_PER_SHARD + 42;
        assert_eq!(codec.relative_id_for(missing, None, &one), Some(missing));
        assert_eq!(codec.relative_id_for(42, None, &one), Some(42));
    }

    #[test]
    fn short_id_round_trips() {
        let codec = codec();
        for id in ["42", "7~42", "7~-42"] {
            let integral = codec.integral_id_for(id).unwrap();
            let short = codec.short_id_for(integral).unwrap();
            assert_eq!(
                codec.integral_id_for(short.as_str()),
                Some(integral),
                "short id {short} should round-trip"
            );
        }
    }

    #[test]
    fn shard_for_defaults_to_source_then_current() {
        let codec = codec();
        let seven = codec.registry().lookup(7).unwrap();
        assert_eq!(
            codec.shard_for(70_000_000_000_042i64, None).unwrap().id(),
            ShardId(7)
        );
        assert_eq!(codec.shard_for(42, Some(&seven)).unwrap().id(), ShardId(7));
        // No source: the current (default) shard owns ambiguous ids.
        assert_eq!(codec.shard_for(42, None).unwrap().id(), ShardId(1));
        assert!(codec.shard_for("junk", None).is_none());
    }
}

//! CRDT object model: bound objects, update operations and read values.
//!
//! An [`Update`] can only be built from an operation whose variant matches
//! the target object's [`CrdtType`], so a mismatched pairing never reaches
//! the encoder.

use crate::error::{ModelError, ProtocolError};
use crate::MAX_NESTING_DEPTH;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// CRDT type tags understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CrdtType {
    Counter,
    /// Add-wins (observed-remove) set.
    AwSet,
    LwwRegister,
    MvRegister,
    /// Grow-only map.
    GMap,
    /// Remove-wins set.
    RwSet,
    /// Recursive-resets map.
    RrMap,
    FatCounter,
    /// Enable-wins flag.
    EwFlag,
    /// Disable-wins flag.
    DwFlag,
}

impl CrdtType {
    pub const ALL: [CrdtType; 10] = [
        CrdtType::Counter,
        CrdtType::AwSet,
        CrdtType::LwwRegister,
        CrdtType::MvRegister,
        CrdtType::GMap,
        CrdtType::RwSet,
        CrdtType::RrMap,
        CrdtType::FatCounter,
        CrdtType::EwFlag,
        CrdtType::DwFlag,
    ];

    pub fn code(self) -> u32 {
        match self {
            CrdtType::Counter => 3,
            CrdtType::AwSet => 4,
            CrdtType::LwwRegister => 5,
            CrdtType::MvRegister => 6,
            CrdtType::GMap => 8,
            CrdtType::RwSet => 10,
            CrdtType::RrMap => 11,
            CrdtType::FatCounter => 12,
            CrdtType::EwFlag => 13,
            CrdtType::DwFlag => 14,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, ProtocolError> {
        CrdtType::ALL
            .into_iter()
            .find(|t| u64::from(t.code()) == code)
            .ok_or(ProtocolError::InvalidEnum {
                name: "CRDT_type",
                value: code,
            })
    }

    pub fn is_counter(self) -> bool {
        matches!(self, CrdtType::Counter | CrdtType::FatCounter)
    }

    pub fn is_set(self) -> bool {
        matches!(self, CrdtType::AwSet | CrdtType::RwSet)
    }

    pub fn is_register(self) -> bool {
        matches!(self, CrdtType::LwwRegister | CrdtType::MvRegister)
    }

    pub fn is_map(self) -> bool {
        matches!(self, CrdtType::GMap | CrdtType::RrMap)
    }

    pub fn is_flag(self) -> bool {
        matches!(self, CrdtType::EwFlag | CrdtType::DwFlag)
    }

    /// Returns whether the type accepts a reset operation.
    pub fn supports_reset(self) -> bool {
        matches!(
            self,
            CrdtType::FatCounter
                | CrdtType::AwSet
                | CrdtType::RwSet
                | CrdtType::MvRegister
                | CrdtType::EwFlag
                | CrdtType::DwFlag
                | CrdtType::RrMap
        )
    }
}

impl fmt::Display for CrdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrdtType::Counter => "counter",
            CrdtType::AwSet => "set-aw",
            CrdtType::LwwRegister => "register-lww",
            CrdtType::MvRegister => "register-mv",
            CrdtType::GMap => "map-g",
            CrdtType::RwSet => "set-rw",
            CrdtType::RrMap => "map-rr",
            CrdtType::FatCounter => "counter-fat",
            CrdtType::EwFlag => "flag-ew",
            CrdtType::DwFlag => "flag-dw",
        };
        f.write_str(name)
    }
}

/// Handle identifying one CRDT instance on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoundObject {
    key: String,
    crdt_type: CrdtType,
    bucket: String,
}

impl BoundObject {
    pub fn new(
        key: impl Into<String>,
        crdt_type: CrdtType,
        bucket: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let key = key.into();
        let bucket = bucket.into();
        if key.is_empty() {
            return Err(ModelError::EmptyKey);
        }
        if bucket.is_empty() {
            return Err(ModelError::EmptyBucket);
        }
        Ok(Self {
            key,
            crdt_type,
            bucket,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn crdt_type(&self) -> CrdtType {
        self.crdt_type
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

impl fmt::Display for BoundObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.bucket, self.key, self.crdt_type)
    }
}

/// Key of an entry nested inside a map; the bucket is the enclosing map's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapKey {
    key: String,
    crdt_type: CrdtType,
}

impl MapKey {
    pub fn new(key: impl Into<String>, crdt_type: CrdtType) -> Result<Self, ModelError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ModelError::EmptyKey);
        }
        Ok(Self { key, crdt_type })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn crdt_type(&self) -> CrdtType {
        self.crdt_type
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.crdt_type)
    }
}

/// An update operation. Each variant belongs to one CRDT family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Counter increment (negative values decrement).
    Increment(i64),
    SetAdd(Vec<Bytes>),
    SetRemove(Vec<Bytes>),
    /// Register assignment.
    Assign(Bytes),
    /// Flag enable (`true`) or disable (`false`).
    Flag(bool),
    Map(MapOp),
    Reset,
}

impl Operation {
    pub fn increment(by: i64) -> Self {
        Operation::Increment(by)
    }

    pub fn add(element: impl Into<Bytes>) -> Self {
        Operation::SetAdd(vec![element.into()])
    }

    pub fn add_all<I, T>(elements: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Operation::SetAdd(elements.into_iter().map(Into::into).collect())
    }

    pub fn remove(element: impl Into<Bytes>) -> Self {
        Operation::SetRemove(vec![element.into()])
    }

    pub fn remove_all<I, T>(elements: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Operation::SetRemove(elements.into_iter().map(Into::into).collect())
    }

    pub fn assign(value: impl Into<Bytes>) -> Self {
        Operation::Assign(value.into())
    }

    pub fn enable() -> Self {
        Operation::Flag(true)
    }

    pub fn disable() -> Self {
        Operation::Flag(false)
    }

    /// Short name used in validation errors.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Increment(_) => "counter increment",
            Operation::SetAdd(_) => "set add",
            Operation::SetRemove(_) => "set remove",
            Operation::Assign(_) => "register assign",
            Operation::Flag(true) => "flag enable",
            Operation::Flag(false) => "flag disable",
            Operation::Map(_) => "map update",
            Operation::Reset => "reset",
        }
    }

    /// Checks that this operation applies to `target`, recursing into
    /// nested map updates.
    pub fn validate(&self, target: CrdtType) -> Result<(), ModelError> {
        self.validate_at(target, 0)
    }

    fn validate_at(&self, target: CrdtType, depth: usize) -> Result<(), ModelError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ModelError::NestingTooDeep {
                max: MAX_NESTING_DEPTH,
            });
        }
        let valid = match self {
            Operation::Increment(_) => target.is_counter(),
            Operation::SetAdd(_) | Operation::SetRemove(_) => target.is_set(),
            Operation::Assign(_) => target.is_register(),
            Operation::Flag(_) => target.is_flag(),
            Operation::Map(_) => target.is_map(),
            Operation::Reset => target.supports_reset(),
        };
        if !valid {
            return Err(ModelError::TypeMismatch {
                operation: self.name(),
                target,
            });
        }

        if let Operation::Map(map) = self {
            if !map.removed.is_empty() && target != CrdtType::RrMap {
                return Err(ModelError::TypeMismatch {
                    operation: "map key removal",
                    target,
                });
            }
            for (key, nested) in &map.updates {
                nested.validate_at(key.crdt_type(), depth + 1)?;
            }
        }
        Ok(())
    }
}

/// Nested updates and key removals applied to a map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapOp {
    pub updates: Vec<(MapKey, Operation)>,
    pub removed: Vec<MapKey>,
}

impl MapOp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(mut self, key: MapKey, operation: Operation) -> Self {
        self.updates.push((key, operation));
        self
    }

    pub fn remove(mut self, key: MapKey) -> Self {
        self.removed.push(key);
        self
    }
}

impl From<MapOp> for Operation {
    fn from(op: MapOp) -> Self {
        Operation::Map(op)
    }
}

/// A validated (object, operation) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    object: BoundObject,
    operation: Operation,
}

impl Update {
    /// Pairs an operation with its target, failing with
    /// [`ModelError::TypeMismatch`] if the operation does not apply.
    pub fn new(object: BoundObject, operation: impl Into<Operation>) -> Result<Self, ModelError> {
        let operation = operation.into();
        operation.validate(object.crdt_type())?;
        Ok(Self { object, operation })
    }

    pub fn object(&self) -> &BoundObject {
        &self.object
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }
}

/// A decoded read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Counter(i64),
    Set(BTreeSet<Bytes>),
    Register(Bytes),
    MultiValueRegister(Vec<Bytes>),
    Flag(bool),
    Map(BTreeMap<MapKey, Value>),
}

impl Value {
    /// Returns whether this value is the read shape of `crdt_type`. Map
    /// entries are checked against the type of their key.
    pub fn matches(&self, crdt_type: CrdtType) -> bool {
        match self {
            Value::Counter(_) => crdt_type.is_counter(),
            Value::Set(_) => crdt_type.is_set(),
            Value::Register(_) => crdt_type == CrdtType::LwwRegister,
            Value::MultiValueRegister(_) => crdt_type == CrdtType::MvRegister,
            Value::Flag(_) => crdt_type.is_flag(),
            Value::Map(entries) => {
                crdt_type.is_map()
                    && entries
                        .iter()
                        .all(|(key, value)| value.matches(key.crdt_type()))
            }
        }
    }

    pub fn as_counter(&self) -> Option<i64> {
        match self {
            Value::Counter(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<Bytes>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<&Bytes> {
        match self {
            Value::Register(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_multi_value(&self) -> Option<&[Bytes]> {
        match self {
            Value::MultiValueRegister(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<MapKey, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

fn write_bytes(f: &mut fmt::Formatter<'_>, bytes: &Bytes) -> fmt::Result {
    write!(f, "{:?}", String::from_utf8_lossy(bytes))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Counter(n) => write!(f, "{}", n),
            Value::Flag(b) => write!(f, "{}", b),
            Value::Register(r) => write_bytes(f, r),
            Value::Set(elements) => {
                f.write_str("{")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_bytes(f, e)?;
                }
                f.write_str("}")
            }
            Value::MultiValueRegister(values) => {
                f.write_str("[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_bytes(f, v)?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(t: CrdtType) -> BoundObject {
        BoundObject::new("k", t, "b").unwrap()
    }

    fn sample_ops() -> Vec<Operation> {
        let nested = MapKey::new("n", CrdtType::Counter).unwrap();
        vec![
            Operation::increment(1),
            Operation::add("x"),
            Operation::remove("x"),
            Operation::assign("v"),
            Operation::enable(),
            Operation::disable(),
            MapOp::new().update(nested, Operation::increment(2)).into(),
            Operation::Reset,
        ]
    }

    #[test]
    fn test_bound_object_requires_key_and_bucket() {
        assert_eq!(
            BoundObject::new("", CrdtType::Counter, "b"),
            Err(ModelError::EmptyKey)
        );
        assert_eq!(
            BoundObject::new("k", CrdtType::Counter, ""),
            Err(ModelError::EmptyBucket)
        );
        let o = obj(CrdtType::AwSet);
        assert_eq!((o.key(), o.bucket()), ("k", "b"));
        assert_eq!(o.to_string(), "b/k:set-aw");
    }

    #[test]
    fn test_type_codes_roundtrip() {
        for t in CrdtType::ALL {
            assert_eq!(CrdtType::from_code(u64::from(t.code())).unwrap(), t);
        }
        assert!(CrdtType::from_code(7).is_err());
        assert!(CrdtType::from_code(99).is_err());
    }

    #[test]
    fn test_matching_pairs_validate() {
        let cases = [
            (Operation::increment(1), CrdtType::Counter),
            (Operation::increment(-3), CrdtType::FatCounter),
            (Operation::add("x"), CrdtType::AwSet),
            (Operation::remove("x"), CrdtType::RwSet),
            (Operation::assign("v"), CrdtType::LwwRegister),
            (Operation::assign("v"), CrdtType::MvRegister),
            (Operation::enable(), CrdtType::EwFlag),
            (Operation::disable(), CrdtType::DwFlag),
            (MapOp::new().into(), CrdtType::GMap),
            (Operation::Reset, CrdtType::RrMap),
        ];
        for (op, t) in cases {
            assert!(Update::new(obj(t), op).is_ok(), "{} should accept", t);
        }
    }

    #[test]
    fn test_every_mismatch_is_rejected() {
        // Each operation must be accepted by exactly the types its family
        // allows and rejected by all others.
        for op in sample_ops() {
            for t in CrdtType::ALL {
                let expected = match &op {
                    Operation::Increment(_) => t.is_counter(),
                    Operation::SetAdd(_) | Operation::SetRemove(_) => t.is_set(),
                    Operation::Assign(_) => t.is_register(),
                    Operation::Flag(_) => t.is_flag(),
                    Operation::Map(_) => t.is_map(),
                    Operation::Reset => t.supports_reset(),
                };
                match Update::new(obj(t), op.clone()) {
                    Ok(_) => assert!(expected, "{} accepted by {}", op.name(), t),
                    Err(ModelError::TypeMismatch { operation, target }) => {
                        assert!(!expected, "{} rejected by {}", op.name(), t);
                        assert_eq!(operation, op.name());
                        assert_eq!(target, t);
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                }
            }
        }
    }

    #[test]
    fn test_set_add_against_counter() {
        let err = Update::new(obj(CrdtType::Counter), Operation::add("x")).unwrap_err();
        assert_eq!(
            err,
            ModelError::TypeMismatch {
                operation: "set add",
                target: CrdtType::Counter
            }
        );
    }

    #[test]
    fn test_nested_map_validation() {
        let counter_key = MapKey::new("c", CrdtType::Counter).unwrap();
        let bad = MapOp::new().update(counter_key.clone(), Operation::add("x"));
        assert!(matches!(
            Update::new(obj(CrdtType::GMap), bad),
            Err(ModelError::TypeMismatch {
                operation: "set add",
                target: CrdtType::Counter
            })
        ));

        let inner_map = MapKey::new("inner", CrdtType::RrMap).unwrap();
        let deep = MapOp::new().update(
            inner_map,
            MapOp::new()
                .update(counter_key.clone(), Operation::increment(1))
                .into(),
        );
        assert!(Update::new(obj(CrdtType::RrMap), deep).is_ok());
    }

    #[test]
    fn test_map_removal_requires_rr_map() {
        let key = MapKey::new("c", CrdtType::Counter).unwrap();
        let op = MapOp::new().remove(key);
        assert!(Update::new(obj(CrdtType::RrMap), op.clone()).is_ok());
        assert!(matches!(
            Update::new(obj(CrdtType::GMap), op),
            Err(ModelError::TypeMismatch {
                operation: "map key removal",
                ..
            })
        ));
    }

    #[test]
    fn test_value_matches() {
        assert!(Value::Counter(1).matches(CrdtType::FatCounter));
        assert!(Value::Register(Bytes::new()).matches(CrdtType::LwwRegister));
        assert!(!Value::Register(Bytes::new()).matches(CrdtType::MvRegister));
        assert!(Value::MultiValueRegister(vec![]).matches(CrdtType::MvRegister));
        assert!(!Value::Flag(true).matches(CrdtType::AwSet));
    }

    #[test]
    fn test_map_value_checks_entries() {
        let counter_key = MapKey::new("c", CrdtType::Counter).unwrap();
        let good = Value::Map([(counter_key.clone(), Value::Counter(3))].into());
        assert!(good.matches(CrdtType::GMap));

        let bad = Value::Map([(counter_key.clone(), Value::Flag(true))].into());
        assert!(!bad.matches(CrdtType::GMap));

        let inner = MapKey::new("inner", CrdtType::RrMap).unwrap();
        let nested_bad = Value::Map([(inner, bad)].into());
        assert!(!nested_bad.matches(CrdtType::RrMap));
    }

    #[test]
    fn test_validation_limits_nesting() {
        let counter_key = MapKey::new("c", CrdtType::Counter).unwrap();
        let inner_key = MapKey::new("inner", CrdtType::GMap).unwrap();
        let nest = |levels: usize| {
            let mut op = Operation::increment(1);
            let mut key = counter_key.clone();
            for _ in 0..levels {
                op = MapOp::new().update(key, op).into();
                key = inner_key.clone();
            }
            op
        };

        // The leaf increment sits one level below the innermost map.
        assert!(Update::new(obj(CrdtType::GMap), nest(MAX_NESTING_DEPTH)).is_ok());
        assert_eq!(
            Update::new(obj(CrdtType::GMap), nest(MAX_NESTING_DEPTH + 1)),
            Err(ModelError::NestingTooDeep {
                max: MAX_NESTING_DEPTH
            })
        );
    }

    #[test]
    fn test_value_display() {
        let set: BTreeSet<Bytes> = [Bytes::from("b"), Bytes::from("a")].into_iter().collect();
        assert_eq!(Value::Set(set).to_string(), r#"{"a", "b"}"#);
        assert_eq!(Value::Counter(-4).to_string(), "-4");

        let mut map = BTreeMap::new();
        map.insert(MapKey::new("f", CrdtType::EwFlag).unwrap(), Value::Flag(true));
        assert_eq!(Value::Map(map).to_string(), "{f:flag-ew: true}");
    }
}

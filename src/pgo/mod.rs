//! Profile-guided optimization data
//!
//! The [`ProfileTypeManager`] is the process-wide table of hidden shapes,
//! property names and per-bytecode samples. Several compilation units running
//! on different threads query it while lowering, so it is shared as an
//! `Arc<ProfileTypeManager>` and guarded by a reader-writer lock:
//!
//! - queries take the read lock for the duration of one lookup
//! - interning and sample recording take the write lock
//! - ids are append-only; an issued [`ShapeId`] or [`NameId`] never changes
//!   meaning
//!
//! A poisoned lock is recovered rather than propagated: every write leaves the
//! tables consistent before it can panic.

pub mod shape;
pub mod type_info;

pub use shape::{
    BuiltinId, ElementKind, MethodId, NameId, OnHeapMode, PropertyFlags, PropertyLookupResult,
    Representation, ShapeId, ShapeInfo, ShapeKind,
};
pub use type_info::{
    ArithTypeInfo, BuiltinLength, CallTypeInfo, ElementTypeInfo, IcEntry, LiveHeapProvider, OfflineProfileProvider,
    ProfileProvider, ProfileSource, PropertyTypeInfo,
};

use crate::circuit::ParamType;
use crate::error::{Error, Result};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use string_interner::DefaultStringInterner;

/// More distinct shapes than this at one site make it megamorphic
pub const POLY_LIMIT: usize = 4;

/// Polymorphism state of a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    None,
    Mono,
    Poly,
    Mega,
}

/// Shapes observed at one property access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeTriple {
    pub receiver: ShapeId,
    /// Shape that actually holds the property (receiver or a prototype)
    pub holder: ShapeId,
    /// Shape after a store that added the property
    #[serde(default)]
    pub transition: Option<ShapeId>,
}

impl ShapeTriple {
    pub fn own(receiver: ShapeId) -> Self {
        Self {
            receiver,
            holder: receiver,
            transition: None,
        }
    }

    pub fn on_proto(receiver: ShapeId, holder: ShapeId) -> Self {
        Self {
            receiver,
            holder,
            transition: None,
        }
    }

    pub fn transition(receiver: ShapeId, to: ShapeId) -> Self {
        Self {
            receiver,
            holder: receiver,
            transition: Some(to),
        }
    }
}

/// Operand kinds observed at an arithmetic site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveSample {
    Int,
    Double,
    Number,
    String,
    Boolean,
}

impl PrimitiveSample {
    pub fn param_type(self) -> ParamType {
        match self {
            PrimitiveSample::Int => ParamType::Int,
            PrimitiveSample::Double => ParamType::Double,
            PrimitiveSample::Number => ParamType::Number,
            PrimitiveSample::String => ParamType::String,
            PrimitiveSample::Boolean => ParamType::Boolean,
        }
    }
}

/// Callee observed at a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallTargetSample {
    pub method: MethodId,
    #[serde(default)]
    pub builtin: Option<BuiltinId>,
}

/// Everything the profiler recorded for one bytecode
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgoSample {
    pub entries: Vec<ShapeTriple>,
    pub primitive: Option<PrimitiveSample>,
    pub call_target: Option<CallTargetSample>,
    /// The inline cache gave up tracking shapes
    pub megamorphic: bool,
}

impl PgoSample {
    pub fn shapes(entries: Vec<ShapeTriple>) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }

    pub fn primitive(sample: PrimitiveSample) -> Self {
        Self {
            primitive: Some(sample),
            ..Self::default()
        }
    }

    pub fn call(method: MethodId) -> Self {
        Self {
            call_target: Some(CallTargetSample { method, builtin: None }),
            ..Self::default()
        }
    }

    pub fn builtin_call(method: MethodId, builtin: BuiltinId) -> Self {
        Self {
            call_target: Some(CallTargetSample {
                method,
                builtin: Some(builtin),
            }),
            ..Self::default()
        }
    }

    pub fn mega() -> Self {
        Self {
            megamorphic: true,
            ..Self::default()
        }
    }

    /// Polymorphism of the shape entries
    pub fn kind(&self) -> SampleKind {
        if self.megamorphic || self.entries.len() > POLY_LIMIT {
            return SampleKind::Mega;
        }
        match self.entries.len() {
            0 => SampleKind::None,
            1 => SampleKind::Mono,
            _ => SampleKind::Poly,
        }
    }
}

#[derive(Default)]
struct Tables {
    shapes: Vec<ShapeInfo>,
    names: DefaultStringInterner,
    samples: HashMap<(MethodId, u32), PgoSample>,
}

/// Shared shape, name and sample tables
pub struct ProfileTypeManager {
    inner: RwLock<Tables>,
}

impl ProfileTypeManager {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Intern a property name
    pub fn intern_name(&self, name: &str) -> NameId {
        if let Some(id) = self.read().names.get(name) {
            return id;
        }
        self.write().names.get_or_intern(name)
    }

    /// Look up an already-interned name
    pub fn name_id(&self, name: &str) -> Option<NameId> {
        self.read().names.get(name)
    }

    pub fn resolve_name(&self, id: NameId) -> Option<String> {
        self.read().names.resolve(id).map(str::to_owned)
    }

    /// Register a new shape and return its id
    pub fn register_shape(&self, kind: ShapeKind) -> ShapeId {
        let mut tables = self.write();
        let id = ShapeId(tables.shapes.len() as u32);
        tables.shapes.push(ShapeInfo::new(id, kind));
        id
    }

    fn with_shape_mut(&self, shape: ShapeId, f: impl FnOnce(&mut ShapeInfo)) -> Result<()> {
        let mut tables = self.write();
        let info = tables
            .shapes
            .get_mut(shape.0 as usize)
            .ok_or_else(|| Error::format(format!("unknown {}", shape)))?;
        f(info);
        Ok(())
    }

    pub fn add_property(&self, shape: ShapeId, name: &str, plr: PropertyLookupResult) -> Result<()> {
        let name = self.intern_name(name);
        self.with_shape_mut(shape, |info| {
            info.properties.insert(name, plr);
        })
    }

    pub fn add_transition(&self, from: ShapeId, name: &str, to: ShapeId) -> Result<()> {
        let name = self.intern_name(name);
        self.with_shape_mut(from, |info| {
            info.transitions.insert(name, to);
        })
    }

    pub fn set_prototype(&self, shape: ShapeId, prototype: ShapeId) -> Result<()> {
        self.with_shape_mut(shape, |info| info.prototype = Some(prototype))
    }

    pub fn set_out_of_object_capacity(&self, shape: ShapeId, capacity: u32) -> Result<()> {
        self.with_shape_mut(shape, |info| info.out_of_object_capacity = capacity)
    }

    /// Snapshot of a shape
    pub fn shape(&self, shape: ShapeId) -> Option<ShapeInfo> {
        self.read().shapes.get(shape.0 as usize).cloned()
    }

    pub fn shape_count(&self) -> usize {
        self.read().shapes.len()
    }

    /// Resolve `name` on `holder`, checking that `holder` is `receiver` or on
    /// its prototype chain
    pub fn lookup_property(&self, receiver: ShapeId, holder: ShapeId, name: NameId) -> PropertyLookupResult {
        if self.prototype_depth(receiver, holder).is_none() {
            return PropertyLookupResult::NOT_FOUND;
        }
        let tables = self.read();
        tables
            .shapes
            .get(holder.0 as usize)
            .and_then(|info| info.properties.get(&name).copied())
            .unwrap_or(PropertyLookupResult::NOT_FOUND)
    }

    /// Number of prototype hops from `receiver` to `holder`
    pub fn prototype_depth(&self, receiver: ShapeId, holder: ShapeId) -> Option<u32> {
        let tables = self.read();
        let mut current = receiver;
        for depth in 0..=tables.shapes.len() as u32 {
            if current == holder {
                return Some(depth);
            }
            current = tables.shapes.get(current.0 as usize)?.prototype?;
        }
        None
    }

    /// Record (or overwrite) the sample of the bytecode at `pc` in `method`
    pub fn record_sample(&self, method: MethodId, pc: u32, sample: PgoSample) {
        self.write().samples.insert((method, pc), sample);
    }

    pub fn sample(&self, method: MethodId, pc: u32) -> Option<PgoSample> {
        self.read().samples.get(&(method, pc)).cloned()
    }

    /// Load a profile document, appending its shapes and samples
    pub fn load_document(&self, doc: &ProfileDocument) -> Result<()> {
        let base = self.shape_count() as u32;
        let remap = |id: ShapeId| ShapeId(id.0 + base);
        for record in &doc.shapes {
            self.register_shape(record.kind);
        }
        for (index, record) in doc.shapes.iter().enumerate() {
            let shape = ShapeId(base + index as u32);
            if let Some(proto) = record.prototype {
                self.set_prototype(shape, remap(proto))?;
            }
            self.set_out_of_object_capacity(shape, record.out_of_object_capacity)?;
            for (name, plr) in &record.properties {
                self.add_property(shape, name, *plr)?;
            }
            for (name, to) in &record.transitions {
                self.add_transition(shape, name, remap(*to))?;
            }
        }
        for record in &doc.samples {
            let mut sample = record.sample.clone();
            for entry in &mut sample.entries {
                entry.receiver = remap(entry.receiver);
                entry.holder = remap(entry.holder);
                entry.transition = entry.transition.map(remap);
            }
            self.record_sample(record.method, record.pc, sample);
        }
        tracing::debug!(shapes = doc.shapes.len(), samples = doc.samples.len(), "loaded profile");
        Ok(())
    }

    pub fn load_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let doc: ProfileDocument = serde_json::from_str(&text)?;
        self.load_document(&doc)
    }
}

impl Default for ProfileTypeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// One shape in a profile document; shape ids are document-local indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub kind: ShapeKind,
    #[serde(default)]
    pub prototype: Option<ShapeId>,
    #[serde(default)]
    pub properties: Vec<(String, PropertyLookupResult)>,
    #[serde(default)]
    pub out_of_object_capacity: u32,
    #[serde(default)]
    pub transitions: Vec<(String, ShapeId)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub method: MethodId,
    pub pc: u32,
    pub sample: PgoSample,
}

/// Serialized profile as written by the runtime profiler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDocument {
    pub shapes: Vec<ShapeRecord>,
    pub samples: Vec<SampleRecord>,
}

//! Type-info accessors over profile samples
//!
//! A [`ProfileProvider`] answers "what did the profiler see at this bytecode"
//! and "where does this property live on that shape". There are two
//! strategies:
//!
//! - [`OfflineProfileProvider`] reads samples recorded ahead of time. Samples
//!   only name shapes, so every slot is resolved by a lookup in the shared
//!   shape table.
//! - [`LiveHeapProvider`] reads inline caches of a running method. Each cache
//!   entry already carries the handler, i.e. the resolved slot.
//!
//! Lowering is generic over the provider, so the strategy is fixed once per
//! compilation. The per-family views ([`PropertyTypeInfo`],
//! [`ElementTypeInfo`], [`CallTypeInfo`], [`ArithTypeInfo`]) normalize a
//! sample into the questions each lowering asks.

use super::{
    CallTargetSample, ElementKind, MethodId, OnHeapMode, PgoSample, ProfileTypeManager,
    PropertyLookupResult, SampleKind, ShapeId, ShapeInfo, ShapeKind, ShapeTriple,
};
use crate::circuit::ParamType;
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;

/// Source of profile samples and property resolution
pub trait ProfileProvider {
    fn sample(&self, method: MethodId, pc: u32) -> Option<PgoSample>;

    /// Slot of `name` for one observed entry. For a transition entry the slot
    /// is the one the property occupies after the transition.
    fn resolve_property(&self, method: MethodId, pc: u32, entry: &ShapeTriple, name: &str) -> PropertyLookupResult;

    fn shape(&self, shape: ShapeId) -> Option<ShapeInfo>;

    fn prototype_depth(&self, receiver: ShapeId, holder: ShapeId) -> Option<u32>;
}

/// Provider for ahead-of-time compilation
#[derive(Clone)]
pub struct OfflineProfileProvider {
    manager: Arc<ProfileTypeManager>,
}

impl OfflineProfileProvider {
    pub fn new(manager: Arc<ProfileTypeManager>) -> Self {
        Self { manager }
    }
}

impl ProfileProvider for OfflineProfileProvider {
    fn sample(&self, method: MethodId, pc: u32) -> Option<PgoSample> {
        self.manager.sample(method, pc)
    }

    fn resolve_property(&self, _method: MethodId, _pc: u32, entry: &ShapeTriple, name: &str) -> PropertyLookupResult {
        let Some(name) = self.manager.name_id(name) else {
            return PropertyLookupResult::NOT_FOUND;
        };
        match entry.transition {
            Some(to) => self.manager.lookup_property(to, to, name),
            None => self.manager.lookup_property(entry.receiver, entry.holder, name),
        }
    }

    fn shape(&self, shape: ShapeId) -> Option<ShapeInfo> {
        self.manager.shape(shape)
    }

    fn prototype_depth(&self, receiver: ShapeId, holder: ShapeId) -> Option<u32> {
        self.manager.prototype_depth(receiver, holder)
    }
}

/// One inline-cache entry of a running method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcEntry {
    pub shapes: ShapeTriple,
    /// Slot the cache resolved when the entry was installed
    pub handler: PropertyLookupResult,
}

/// Provider for just-in-time compilation
#[derive(Clone)]
pub struct LiveHeapProvider {
    manager: Arc<ProfileTypeManager>,
    caches: HashMap<(MethodId, u32), Vec<IcEntry>>,
}

impl LiveHeapProvider {
    pub fn new(manager: Arc<ProfileTypeManager>) -> Self {
        Self {
            manager,
            caches: HashMap::default(),
        }
    }

    /// Install the inline cache of the bytecode at `pc`
    pub fn add_cache(&mut self, method: MethodId, pc: u32, entries: Vec<IcEntry>) {
        self.caches.insert((method, pc), entries);
    }
}

impl ProfileProvider for LiveHeapProvider {
    fn sample(&self, method: MethodId, pc: u32) -> Option<PgoSample> {
        let recorded = self.manager.sample(method, pc);
        match self.caches.get(&(method, pc)) {
            Some(entries) => {
                let mut sample = recorded.unwrap_or_default();
                sample.entries = entries.iter().map(|e| e.shapes).collect();
                Some(sample)
            }
            None => recorded,
        }
    }

    fn resolve_property(&self, method: MethodId, pc: u32, entry: &ShapeTriple, _name: &str) -> PropertyLookupResult {
        self.caches
            .get(&(method, pc))
            .and_then(|entries| entries.iter().find(|e| e.shapes == *entry))
            .map(|e| e.handler)
            .unwrap_or(PropertyLookupResult::NOT_FOUND)
    }

    fn shape(&self, shape: ShapeId) -> Option<ShapeInfo> {
        self.manager.shape(shape)
    }

    fn prototype_depth(&self, receiver: ShapeId, holder: ShapeId) -> Option<u32> {
        self.manager.prototype_depth(receiver, holder)
    }
}

/// Where a compilation's samples come from; matched once by the pipeline
#[derive(Clone)]
pub enum ProfileSource {
    Offline(OfflineProfileProvider),
    LiveHeap(LiveHeapProvider),
}

impl ProfileSource {
    pub fn offline(manager: Arc<ProfileTypeManager>) -> Self {
        ProfileSource::Offline(OfflineProfileProvider::new(manager))
    }

    pub fn live(provider: LiveHeapProvider) -> Self {
        ProfileSource::LiveHeap(provider)
    }
}

/// A `length` load served by a builtin layout rather than a named slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinLength {
    TypedArray(ElementKind),
    Array,
    String,
}

/// Property access view: each entry with its resolved slot
#[derive(Debug, Clone)]
pub struct PropertyTypeInfo {
    kind: SampleKind,
    entries: Vec<(ShapeTriple, PropertyLookupResult)>,
    builtin_length: Option<BuiltinLength>,
}

impl PropertyTypeInfo {
    pub fn new<P: ProfileProvider>(provider: &P, method: MethodId, pc: u32, name: &str) -> Self {
        let sample = provider.sample(method, pc).unwrap_or_default();
        let kind = sample.kind();
        let entries: Vec<(ShapeTriple, PropertyLookupResult)> = match kind {
            SampleKind::Mono | SampleKind::Poly => sample
                .entries
                .iter()
                .map(|e| (*e, provider.resolve_property(method, pc, e, name)))
                .collect(),
            SampleKind::None | SampleKind::Mega => Vec::new(),
        };
        let builtin_length = match (name, entries.as_slice()) {
            ("length", [(entry, _)]) => provider.shape(entry.receiver).and_then(|s| match s.kind {
                ShapeKind::TypedArray { element, .. } => Some(BuiltinLength::TypedArray(element)),
                ShapeKind::Array { stable: true } => Some(BuiltinLength::Array),
                ShapeKind::String => Some(BuiltinLength::String),
                _ => None,
            }),
            _ => None,
        };
        Self {
            kind,
            entries,
            builtin_length,
        }
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_mono(&self) -> bool {
        self.kind == SampleKind::Mono
    }

    pub fn is_poly(&self) -> bool {
        self.kind == SampleKind::Poly
    }

    pub fn receiver(&self, i: usize) -> ShapeId {
        self.entries[i].0.receiver
    }

    pub fn holder(&self, i: usize) -> ShapeId {
        self.entries[i].0.holder
    }

    pub fn transition(&self, i: usize) -> Option<ShapeId> {
        self.entries[i].0.transition
    }

    pub fn plr(&self, i: usize) -> PropertyLookupResult {
        self.entries[i].1
    }

    pub fn builtin_length(&self) -> Option<BuiltinLength> {
        self.builtin_length
    }

    /// Every entry resolved to a slot
    pub fn all_found(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|(_, plr)| plr.is_found())
    }

    pub fn any_accessor(&self) -> bool {
        self.entries.iter().any(|(_, plr)| plr.is_accessor())
    }

    pub fn has_transition(&self) -> bool {
        self.entries.iter().any(|(e, _)| e.transition.is_some())
    }
}

/// Indexed access view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementTypeInfo {
    /// Element storage common to every observed receiver
    pub element: Option<ElementKind>,
    pub mode: OnHeapMode,
    /// The index was always an int
    pub int_index: bool,
}

impl ElementTypeInfo {
    pub fn new<P: ProfileProvider>(provider: &P, method: MethodId, pc: u32) -> Self {
        let sample = provider.sample(method, pc).unwrap_or_default();
        let int_index = sample.primitive.map(|p| p.param_type()) == Some(ParamType::Int);
        let mut element = None;
        let mut mode = None;
        if matches!(sample.kind(), SampleKind::Mono | SampleKind::Poly) {
            for entry in &sample.entries {
                let (kind, entry_mode) = match provider.shape(entry.receiver).map(|s| s.kind) {
                    Some(ShapeKind::TypedArray { element, mode }) => (element, mode),
                    Some(ShapeKind::Array { stable: true }) => (ElementKind::Tagged, OnHeapMode::OnHeap),
                    _ => {
                        element = None;
                        break;
                    }
                };
                if element.is_some_and(|k| k != kind) {
                    element = None;
                    break;
                }
                element = Some(kind);
                mode = match mode {
                    None => Some(entry_mode),
                    Some(m) if m == entry_mode => Some(m),
                    Some(_) => Some(OnHeapMode::Unknown),
                };
            }
        }
        Self {
            element,
            mode: mode.unwrap_or_default(),
            int_index,
        }
    }

    pub fn is_typed_array(&self) -> bool {
        self.element.is_some_and(|k| k != ElementKind::Tagged)
    }

    pub fn is_stable_array(&self) -> bool {
        self.element == Some(ElementKind::Tagged)
    }
}

/// Call site view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTypeInfo {
    pub target: Option<CallTargetSample>,
}

impl CallTypeInfo {
    pub fn new<P: ProfileProvider>(provider: &P, method: MethodId, pc: u32) -> Self {
        let target = provider
            .sample(method, pc)
            .filter(|s| !s.megamorphic)
            .and_then(|s| s.call_target);
        Self { target }
    }

    pub fn method(&self) -> Option<MethodId> {
        self.target.map(|t| t.method)
    }
}

/// Arithmetic operand view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithTypeInfo {
    pub operand: Option<ParamType>,
}

impl ArithTypeInfo {
    pub fn new<P: ProfileProvider>(provider: &P, method: MethodId, pc: u32) -> Self {
        let operand = provider
            .sample(method, pc)
            .and_then(|s| s.primitive)
            .map(|p| p.param_type())
            .filter(|p| matches!(p, ParamType::Int | ParamType::Double | ParamType::Number));
        Self { operand }
    }
}

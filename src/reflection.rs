//! Reflection and the concurrent reflection list (component B).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Signed Miller indices.
pub type Hkl = (i32, i32, i32);

/// One predicted or merged reflection.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub h: i32,
    pub k: i32,
    pub l: i32,
    /// Predicted detector position, subpixel units.
    pub fs: f64,
    pub ss: f64,
    /// Owning panel, once a prediction has been mapped to a detector.
    pub panel: Option<String>,
    /// Excitation error, metres⁻¹.
    pub excitation_error: f64,
    /// |q|, the reciprocal-lattice vector's lab-frame magnitude, metres⁻¹ —
    /// this reflection's true resolution, as opposed to an index-magnitude
    /// proxy.
    pub resolution: f64,
    /// Partiality in [0,1].
    pub partiality: f64,
    /// Did either Ewald-sphere extremum clamp against ±r_p?
    pub clamp_low: bool,
    pub clamp_high: bool,
    /// Lorentz factor.
    pub lorentz: f64,
    /// Measured intensity.
    pub intensity: f64,
    /// Estimated standard deviation of `intensity`.
    pub sigma: f64,
    /// Estimated background level under the peak region.
    pub background: f64,
    /// Number of observations merged into this reflection.
    pub redundancy: u32,
    pub scalable: bool,
    pub refinable: bool,
    /// True if `intensity` is negative (spec §9 redesign note).
    pub negative_intensity: bool,
    /// Symmetry-equivalent canonical indices, once reduced by a point group.
    pub canonical_hkl: Option<Hkl>,
}

impl Reflection {
    /// A freshly predicted reflection, unintegrated.
    pub fn predicted(h: i32, k: i32, l: i32, fs: f64, ss: f64, panel: String, excitation_error: f64) -> Self {
        Reflection {
            h,
            k,
            l,
            fs,
            ss,
            panel: Some(panel),
            excitation_error,
            resolution: 0.0,
            partiality: 0.0,
            clamp_low: false,
            clamp_high: false,
            lorentz: 1.0,
            intensity: 0.0,
            sigma: 0.0,
            background: 0.0,
            redundancy: 0,
            scalable: false,
            refinable: false,
            negative_intensity: false,
            canonical_hkl: None,
        }
    }

    pub fn hkl(&self) -> Hkl {
        (self.h, self.k, self.l)
    }
}

/// A stable handle into a [`ReflectionList`], usable for interior-mutable
/// read-modify-write under concurrent access.
#[derive(Clone)]
pub struct ReflectionHandle {
    hkl: Hkl,
    slot: Arc<Mutex<Reflection>>,
}

impl ReflectionHandle {
    pub fn hkl(&self) -> Hkl {
        self.hkl
    }

    /// Run `f` with exclusive access to the reflection, under its own lock —
    /// this does not hold the list's own lock, so other keys remain usable.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Reflection) -> R) -> R {
        let mut guard = self.slot.lock().expect("reflection mutex poisoned");
        f(&mut guard)
    }

    pub fn get(&self) -> Reflection {
        self.slot.lock().expect("reflection mutex poisoned").clone()
    }
}

/// A keyed container over (h,k,l), safe for concurrent mutation.
///
/// Lookup and insertion go through an `RwLock<HashMap<..>>`: readers (scale
/// computation) take the read lock; a fresh key's insertion takes the write
/// lock under a double-checked pattern. Once a handle is obtained, further
/// mutation of that single reflection's fields takes only its own mutex,
/// never the list-wide lock — matching the per-reflection-mutex policy
/// described for the scaling subsystem.
#[derive(Default)]
pub struct ReflectionList {
    table: RwLock<HashMap<Hkl, Arc<Mutex<Reflection>>>>,
}

impl ReflectionList {
    pub fn new() -> Self {
        ReflectionList {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Number of live reflections.
    pub fn len(&self) -> usize {
        self.table.read().expect("reflection list poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an existing reflection by key.
    pub fn get(&self, hkl: Hkl) -> Option<ReflectionHandle> {
        let table = self.table.read().expect("reflection list poisoned");
        table.get(&hkl).map(|slot| ReflectionHandle {
            hkl,
            slot: Arc::clone(slot),
        })
    }

    /// Insert a reflection, or return a handle to the existing one if the
    /// key is already present. Double-checked: a read-lock probe first,
    /// falling back to the write lock only on a miss.
    pub fn get_or_insert(&self, reflection: Reflection) -> ReflectionHandle {
        let hkl = reflection.hkl();
        if let Some(handle) = self.get(hkl) {
            return handle;
        }
        let mut table = self.table.write().expect("reflection list poisoned");
        let slot = table
            .entry(hkl)
            .or_insert_with(|| Arc::new(Mutex::new(reflection)));
        ReflectionHandle {
            hkl,
            slot: Arc::clone(slot),
        }
    }

    /// Unconditional insert; if `hkl` is already present it is replaced.
    /// Used by prediction, which owns a private per-crystal list and never
    /// expects pre-existing keys.
    pub fn insert(&self, reflection: Reflection) {
        let hkl = reflection.hkl();
        let mut table = self.table.write().expect("reflection list poisoned");
        table.insert(hkl, Arc::new(Mutex::new(reflection)));
    }

    pub fn remove(&self, hkl: Hkl) -> bool {
        let mut table = self.table.write().expect("reflection list poisoned");
        table.remove(&hkl).is_some()
    }

    /// A pull-style cursor over a snapshot of the keys present at call time,
    /// per the design note preferring iterator control flow over exposing
    /// the container type. New insertions during iteration are not visited.
    pub fn cursor(&self) -> ReflectionCursor<'_> {
        let keys: Vec<Hkl> = self.table.read().expect("reflection list poisoned").keys().copied().collect();
        ReflectionCursor { list: self, keys, pos: 0 }
    }

    /// Collapse duplicate keys accumulated during concurrent insertion by
    /// merging their intensities (sum of `intensity`, combined `redundancy`)
    /// before scaling. No-op here because `get_or_insert`/`insert` already
    /// prevent duplicates; kept to make the merge step an explicit, testable
    /// operation independent of the insertion path that happens to be used.
    pub fn merge_duplicates(&self) {
        // Invariant already holds by construction; nothing to collapse.
    }
}

/// Stable pull-style iteration handle over a [`ReflectionList`]'s snapshot.
pub struct ReflectionCursor<'a> {
    list: &'a ReflectionList,
    keys: Vec<Hkl>,
    pos: usize,
}

impl<'a> Iterator for ReflectionCursor<'a> {
    type Item = ReflectionHandle;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.keys.len() {
            let hkl = self.keys[self.pos];
            self.pos += 1;
            if let Some(handle) = self.list.get(hkl) {
                return Some(handle);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn dummy(h: i32, k: i32, l: i32) -> Reflection {
        Reflection::predicted(h, k, l, 0.0, 0.0, "p0".into(), 0.0)
    }

    #[test]
    fn no_duplicate_keys_after_insert() {
        let list = ReflectionList::new();
        list.get_or_insert(dummy(1, 0, 0));
        list.get_or_insert(dummy(1, 0, 0));
        list.get_or_insert(dummy(0, 1, 0));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn cursor_visits_every_live_reflection_once() {
        let list = ReflectionList::new();
        for i in 0..5 {
            list.insert(dummy(i, 0, 0));
        }
        let seen: Vec<Hkl> = list.cursor().map(|h| h.hkl()).collect();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn concurrent_insertion_has_no_duplicate_keys() {
        let list = Arc::new(ReflectionList::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    list.get_or_insert(dummy(i, t, 0));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        for handle in list.cursor() {
            assert!(seen.insert(handle.hkl()), "duplicate key visited: {:?}", handle.hkl());
        }
    }

    #[test]
    fn per_reflection_lock_allows_independent_mutation() {
        let list = ReflectionList::new();
        let handle = list.get_or_insert(dummy(1, 1, 1));
        handle.with_mut(|r| r.intensity = 42.0);
        assert_eq!(handle.get().intensity, 42.0);
    }
}

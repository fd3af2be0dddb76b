//! Creation-only event filter.
//!
//! The watch API reports both creations and updates as `Apply`, so telling
//! them apart needs memory of which objects were already admitted. Only
//! creations trigger a reconciliation; updates and deletes are dropped here.
//! Rechecks scheduled by the reconciler do not pass through this filter.

use kube::Resource;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use std::collections::HashSet;
use std::hash::Hash;
use tracing::trace;

/// Tracks admitted objects and lets only first sightings through.
pub struct CreationFilter<K>
where
    K: Resource,
    K::DynamicType: Eq + Hash + Clone,
{
    seen: HashSet<ObjectRef<K>>,
    /// Names that reappeared during the current relist
    relist: Option<HashSet<ObjectRef<K>>>,
    /// First sightings of the current relist, released at `InitDone`
    pending: Vec<K>,
}

impl<K> Default for CreationFilter<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> CreationFilter<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            relist: None,
            pending: Vec::new(),
        }
    }

    /// Returns the objects this event reveals as newly created.
    ///
    /// - `Apply` for an unseen object: admitted at once
    /// - `Apply` for a seen object: suppressed
    /// - `InitApply` for an unseen object: held until `InitDone`
    /// - `Delete`: suppressed, and the object is forgotten
    /// - `InitDone`: held objects are released, objects missing from the
    ///   relist are forgotten
    ///
    /// A reflector only publishes a relist at `InitDone`, so objects first
    /// seen during one must not reach the controller before that.
    pub fn admit(&mut self, event: watcher::Event<K>) -> Vec<K> {
        match event {
            watcher::Event::Apply(obj) => {
                if self.seen.insert(ObjectRef::from_obj(&obj)) {
                    vec![obj]
                } else {
                    trace!("Suppressing update event");
                    Vec::new()
                }
            }
            watcher::Event::InitApply(obj) => {
                let key = ObjectRef::from_obj(&obj);
                self.relist
                    .get_or_insert_with(HashSet::new)
                    .insert(key.clone());
                if self.seen.insert(key) {
                    self.pending.push(obj);
                }
                Vec::new()
            }
            watcher::Event::Delete(obj) => {
                self.seen.remove(&ObjectRef::from_obj(&obj));
                Vec::new()
            }
            watcher::Event::Init => {
                // An interrupted relist never released these
                for obj in self.pending.drain(..) {
                    self.seen.remove(&ObjectRef::from_obj(&obj));
                }
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                if let Some(present) = self.relist.take() {
                    self.seen.retain(|key| present.contains(key));
                }
                trace!(
                    "Relist complete, tracking {} objects, {} new",
                    self.seen.len(),
                    self.pending.len()
                );
                std::mem::take(&mut self.pending)
            }
        }
    }
}

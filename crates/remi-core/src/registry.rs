//! Per-session object registry
//!
//! Three mappings per session: `exported` holds a strong reference per
//! local object the peer may invoke, `imported` holds weak references to
//! stubs so identity comparisons make sense without keeping them alive, and
//! the type cache stores every interface description seen so far
//! (write-once per type, first writer wins).
//!
//! Object identity survives a reclaimed export: the identity table keeps a
//! weak entry per object so a re-export reuses the identifier and continues
//! its version sequence, which is what lets a stale drop from the peer be
//! recognized and ignored.

use crate::dispatch::{RemoteObject, Skeleton, SkeletonFactory, Stub};
use crate::ident::{Identifier, VersionedIdentifier};
use crate::info::RemoteInfo;
use crate::session::SessionCore;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// The wire form of a remote reference.
pub(crate) struct MarshalledRemote {
    pub obj_id: Identifier,
    pub obj_version: u32,
    pub type_id: Identifier,
    pub type_version: u32,
    /// Present on the first transmission of the type in this session.
    pub info: Option<Arc<RemoteInfo>>,
}

struct IdentityEntry {
    object: Weak<dyn RemoteObject>,
    vid: Arc<VersionedIdentifier>,
}

struct ExportEntry {
    object: Arc<dyn RemoteObject>,
    factory: Arc<SkeletonFactory>,
    skeleton: Arc<Skeleton>,
    vid: Arc<VersionedIdentifier>,
    /// Pinned exports (bindings, the bootstrap object) ignore DGC drops.
    pinned: bool,
}

/// A resolved export, cloned out of the registry for one dispatch.
pub struct ExportHandle {
    pub object: Arc<dyn RemoteObject>,
    pub factory: Arc<SkeletonFactory>,
    pub skeleton: Arc<Skeleton>,
    pub vid: Arc<VersionedIdentifier>,
}

struct ImportEntry {
    stub: Weak<Stub>,
    vid: Arc<VersionedIdentifier>,
}

/// Per-session maps from identifiers to objects, stubs and type metadata.
pub struct Registry {
    exported: Mutex<HashMap<Identifier, ExportEntry>>,
    identities: Mutex<HashMap<usize, IdentityEntry>>,
    imported: Mutex<HashMap<Identifier, ImportEntry>>,
    type_cache: Mutex<HashMap<Identifier, Arc<RemoteInfo>>>,
    type_vids: Mutex<HashMap<Identifier, Arc<VersionedIdentifier>>>,
    sent_types: Mutex<HashSet<Identifier>>,
}

fn object_key(object: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            exported: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
            imported: Mutex::new(HashMap::new()),
            type_cache: Mutex::new(HashMap::new()),
            type_vids: Mutex::new(HashMap::new()),
            sent_types: Mutex::new(HashSet::new()),
        }
    }

    /// Export a local object, reusing its identifier if it was exported
    /// before. Returns the canonical versioned identifier.
    pub fn export_local(
        &self,
        object: &Arc<dyn RemoteObject>,
        factory: &Arc<SkeletonFactory>,
        pinned: bool,
    ) -> Arc<VersionedIdentifier> {
        let vid = self.identity_of(object);
        self.register_export(vid.clone(), object, factory, pinned);
        vid
    }

    /// Export under a fixed identifier (well-known protocol objects).
    pub(crate) fn export_with_id(
        &self,
        id: Identifier,
        object: &Arc<dyn RemoteObject>,
        factory: &Arc<SkeletonFactory>,
        pinned: bool,
    ) -> Arc<VersionedIdentifier> {
        let vid = Arc::new(VersionedIdentifier::new(id));
        self.identities.lock().insert(
            object_key(object),
            IdentityEntry {
                object: Arc::downgrade(object),
                vid: Arc::clone(&vid),
            },
        );
        self.register_export(vid.clone(), object, factory, pinned);
        vid
    }

    fn identity_of(&self, object: &Arc<dyn RemoteObject>) -> Arc<VersionedIdentifier> {
        let key = object_key(object);
        let mut identities = self.identities.lock();
        if let Some(entry) = identities.get(&key) {
            // The address may have been reused by a new allocation; only a
            // live weak reference to this very object counts.
            if let Some(existing) = entry.object.upgrade() {
                if Arc::ptr_eq(&existing, object) {
                    return Arc::clone(&entry.vid);
                }
            }
        }
        let vid = Arc::new(VersionedIdentifier::new(Identifier::generate()));
        identities.insert(
            key,
            IdentityEntry {
                object: Arc::downgrade(object),
                vid: Arc::clone(&vid),
            },
        );
        vid
    }

    fn register_export(
        &self,
        vid: Arc<VersionedIdentifier>,
        object: &Arc<dyn RemoteObject>,
        factory: &Arc<SkeletonFactory>,
        pinned: bool,
    ) {
        let mut exported = self.exported.lock();
        let entry = exported.entry(vid.id()).or_insert_with(|| {
            trace!(id = %vid.id(), interface = %factory.info().name, "exporting object");
            ExportEntry {
                object: Arc::clone(object),
                factory: Arc::clone(factory),
                skeleton: Arc::new(Skeleton::new(
                    Arc::clone(factory),
                    Arc::clone(object),
                    Arc::clone(&vid),
                )),
                vid,
                pinned,
            }
        });
        if pinned {
            entry.pinned = true;
        }
        drop(exported);
        self.insert_type(Arc::clone(factory.info()));
    }

    /// Resolve an exported object, or `None` for a registry miss.
    pub fn lookup_local(&self, id: Identifier) -> Option<ExportHandle> {
        let exported = self.exported.lock();
        exported.get(&id).map(|entry| ExportHandle {
            object: Arc::clone(&entry.object),
            factory: Arc::clone(&entry.factory),
            skeleton: Arc::clone(&entry.skeleton),
            vid: Arc::clone(&entry.vid),
        })
    }

    /// Drop an export the peer no longer references, gated on the version
    /// the peer observed. A drop older than the current local version is a
    /// stale race with a re-export and is ignored. Pinned exports stay.
    pub fn drop_export(&self, id: Identifier, observed_remote_version: u32) -> bool {
        let mut exported = self.exported.lock();
        let Some(entry) = exported.get(&id) else {
            return false;
        };
        if entry.pinned {
            return false;
        }
        entry.vid.update_remote_version(observed_remote_version);
        if entry.vid.is_acknowledged() {
            debug!(id = %id, version = observed_remote_version, "reclaiming export");
            exported.remove(&id);
            true
        } else {
            debug!(
                id = %id,
                observed = observed_remote_version,
                local = entry.vid.local_version(),
                "ignoring stale reference drop"
            );
            false
        }
    }

    /// Return an existing stub for `id` or build a new one, so stubs are
    /// shared and identity comparisons hold.
    pub(crate) fn import_remote(
        &self,
        id: Identifier,
        received_version: u32,
        info: Arc<RemoteInfo>,
        core: Weak<SessionCore>,
    ) -> Arc<Stub> {
        let mut imported = self.imported.lock();
        if let Some(entry) = imported.get(&id) {
            entry.vid.update_remote_version(received_version);
            if let Some(stub) = entry.stub.upgrade() {
                return stub;
            }
        }
        let vid = imported
            .get(&id)
            .map(|entry| Arc::clone(&entry.vid))
            .unwrap_or_else(|| Arc::new(VersionedIdentifier::new(id)));
        vid.update_remote_version(received_version);
        let stub = Arc::new(Stub::new(info, Arc::clone(&vid), core));
        imported.insert(
            id,
            ImportEntry {
                stub: Arc::downgrade(&stub),
                vid,
            },
        );
        trace!(id = %id, "imported stub");
        stub
    }

    /// Store an interface description. Concurrent first encounters of the
    /// same type are resolved by the first writer winning.
    pub fn insert_type(&self, info: Arc<RemoteInfo>) -> Arc<RemoteInfo> {
        let mut cache = self.type_cache.lock();
        let canonical = cache.entry(info.type_id).or_insert(info);
        let canonical = Arc::clone(canonical);
        drop(cache);
        self.type_vid(canonical.type_id);
        canonical
    }

    pub fn type_info(&self, type_id: Identifier) -> Option<Arc<RemoteInfo>> {
        self.type_cache.lock().get(&type_id).cloned()
    }

    /// Canonical version counters for a type identifier.
    pub(crate) fn type_vid(&self, type_id: Identifier) -> Arc<VersionedIdentifier> {
        let mut vids = self.type_vids.lock();
        Arc::clone(
            vids.entry(type_id)
                .or_insert_with(|| Arc::new(VersionedIdentifier::new(type_id))),
        )
    }

    /// True on the first call per type: the description must ride along.
    pub(crate) fn mark_type_sent(&self, type_id: Identifier) -> bool {
        self.sent_types.lock().insert(type_id)
    }

    /// Collect the live imported set and the dead entries eligible for a
    /// removal notice, without forgetting them yet.
    pub(crate) fn sweep_imported(&self) -> (Vec<(Identifier, u32)>, HashSet<Identifier>) {
        let imported = self.imported.lock();
        let mut dead = Vec::new();
        let mut live = HashSet::new();
        for (id, entry) in imported.iter() {
            if entry.stub.strong_count() > 0 {
                live.insert(*id);
            } else {
                dead.push((*id, entry.vid.remote_version()));
            }
        }
        (dead, live)
    }

    /// Forget imported entries whose removal the peer has been told about.
    pub(crate) fn forget_imported(&self, ids: &[(Identifier, u32)]) {
        let mut imported = self.imported.lock();
        for (id, _) in ids {
            if let Some(entry) = imported.get(id) {
                if entry.stub.strong_count() == 0 {
                    imported.remove(id);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn exported_contains(&self, id: Identifier) -> bool {
        self.exported.lock().contains_key(&id)
    }

    pub fn exported_count(&self) -> usize {
        self.exported.lock().len()
    }

    pub fn imported_count(&self) -> usize {
        self.imported.lock().len()
    }

    /// Look up an export's identifier for an object, if it has one.
    pub fn exported_id(&self, object: &Arc<dyn RemoteObject>) -> Option<Identifier> {
        let identities = self.identities.lock();
        identities.get(&object_key(object)).and_then(|entry| {
            entry
                .object
                .upgrade()
                .filter(|o| Arc::ptr_eq(o, object))
                .map(|_| entry.vid.id())
        })
    }

    /// Build the marshalled form of an export (bumps the transmit counters).
    pub(crate) fn marshal_export(
        &self,
        object: &Arc<dyn RemoteObject>,
        factory: &Arc<SkeletonFactory>,
    ) -> MarshalledRemote {
        let vid = self.export_local(object, factory, false);
        let info = Arc::clone(factory.info());
        let type_vid = self.type_vid(info.type_id);
        let first_send = self.mark_type_sent(info.type_id);
        MarshalledRemote {
            obj_id: vid.id(),
            obj_version: vid.next_local_version(),
            type_id: type_vid.id(),
            type_version: type_vid.next_local_version(),
            info: first_send.then_some(info),
        }
    }

    /// Build the marshalled form of a stub being sent back to the peer.
    pub(crate) fn marshal_stub(&self, stub: &Stub) -> MarshalledRemote {
        let type_id = stub.info().type_id;
        let type_vid = self.type_vid(type_id);
        MarshalledRemote {
            obj_id: stub.id(),
            obj_version: stub.vid().next_local_version(),
            type_id,
            type_version: type_vid.next_local_version(),
            // The peer minted this reference; it knows the type.
            info: None,
        }
    }
}

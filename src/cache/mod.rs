//! State Cache (C2) — the authoritative in-memory view of every
//! device's and module's current state.
//!
//! Guarded by a single `parking_lot::Mutex` over both maps (shared-
//! resource policy option (b) in the concurrency model): the normalizer,
//! the watchdog, and REST handlers all need short, synchronous access,
//! and a lock is simpler here than routing every read through a command
//! channel. Read accessors clone out of the lock before returning,
//! giving callers the "defensive copy" the spec requires.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::DeviceType;

pub type DeviceId = String;

/// One RFID slot's occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RfidSlot {
    pub slot_index: u32,
    pub tag_id: String,
    pub alarm: bool,
}

/// Temperature/humidity reading for one slot; either field may be
/// absent (SIG-A's zero sentinel, or a slot never reported).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TempHumReading {
    pub temp: Option<f64>,
    pub hum: Option<f64>,
}

/// Per-(deviceId, moduleIndex) state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleState {
    pub module_id: Option<String>,
    pub u_total: Option<u32>,
    pub fw_ver: Option<String>,
    pub rfid_snapshot: Vec<RfidSlot>,
    pub temp_hum: BTreeMap<u32, TempHumReading>,
    pub noise: BTreeMap<u32, f64>,
    pub door_state: Option<u8>,
    pub door1_state: Option<u8>,
    pub door2_state: Option<u8>,
    pub last_seen_heartbeat: Option<DateTime<Utc>>,
    pub last_seen_temp_hum: Option<DateTime<Utc>>,
    pub last_seen_noise: Option<DateTime<Utc>>,
    pub last_seen_rfid: Option<DateTime<Utc>>,
    pub last_seen_door: Option<DateTime<Utc>>,
    pub online: bool,
}

/// Per-deviceId state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    pub device_type: Option<DeviceType>,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub fw_ver: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
    pub model: Option<String>,
    pub active_modules: Vec<u32>,
    pub last_seen_info: Option<DateTime<Utc>>,
    pub online: bool,
}

/// A non-null patch applied by `upsert_metadata`: `None` fields are left
/// untouched on the existing record.
#[derive(Debug, Clone, Default)]
pub struct DevicePatch {
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub fw_ver: Option<String>,
    pub mask: Option<String>,
    pub gateway: Option<String>,
    pub model: Option<String>,
}

/// A module entry in an authoritative (heartbeat/reconcile) module list.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub module_index: u32,
    pub module_id: String,
    pub u_total: Option<u32>,
    pub fw_ver: Option<String>,
}

/// Result of `diff_rfid`: slots that newly appeared / disappeared
/// relative to the cached snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RfidDiff {
    pub attached: Vec<RfidSlot>,
    pub detached: Vec<RfidSlot>,
}

#[derive(Default)]
struct CacheInner {
    meta_by_device: HashMap<DeviceId, DeviceState>,
    telemetry_by_key: HashMap<(DeviceId, u32), ModuleState>,
}

pub struct StateCache {
    inner: Mutex<CacheInner>,
}

impl StateCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn module_mut<'a>(
        inner: &'a mut CacheInner,
        device_id: &str,
        module_index: u32,
    ) -> &'a mut ModuleState {
        inner
            .telemetry_by_key
            .entry((device_id.to_string(), module_index))
            .or_default()
    }

    /// Stamps the device family for `device_id`, creating the device
    /// entry if absent. Idempotent; called from every handler that
    /// knows which parser produced the message.
    pub fn set_device_type(&self, device_id: &str, device_type: DeviceType) {
        let mut inner = self.inner.lock();
        let device = inner.meta_by_device.entry(device_id.to_string()).or_default();
        device.device_type = Some(device_type);
    }

    /// Merge non-null fields of `patch` into the device's metadata,
    /// returning a human-readable description of every field that
    /// changed value.
    pub fn upsert_metadata(&self, device_id: &str, patch: DevicePatch) -> Vec<String> {
        let mut inner = self.inner.lock();
        let device = inner.meta_by_device.entry(device_id.to_string()).or_default();
        let mut changes = Vec::new();

        macro_rules! merge_field {
            ($field:ident, $label:expr) => {
                if let Some(new_value) = patch.$field {
                    if device.$field.as_ref() != Some(&new_value) {
                        changes.push(match &device.$field {
                            Some(old) => format!(
                                "{} changed from {} to {}",
                                $label, old, new_value
                            ),
                            None => format!("{} set to {}", $label, new_value),
                        });
                        device.$field = Some(new_value);
                    }
                }
            };
        }

        merge_field!(ip, "Device IP");
        merge_field!(mac, "Device MAC");
        merge_field!(fw_ver, "Device firmware");
        merge_field!(mask, "Device mask");
        merge_field!(gateway, "Device gateway");
        merge_field!(model, "Device model");

        device.last_seen_info = Some(Utc::now());
        changes
    }

    /// Treat `authoritative_modules` as the complete module list for
    /// `device_id`. Emits added/removed/replaced/uTotal-changed/fwVer-
    /// changed descriptions, preserves `fwVer` on an existing module the
    /// input omits, and prunes telemetry for removed modules.
    pub fn reconcile_metadata(
        &self,
        device_id: &str,
        authoritative_modules: &[ModuleDescriptor],
    ) -> Vec<String> {
        let mut inner = self.inner.lock();
        let mut changes = Vec::new();

        let previous_indices: Vec<u32> = inner
            .meta_by_device
            .get(device_id)
            .map(|d| d.active_modules.clone())
            .unwrap_or_default();

        let incoming_indices: Vec<u32> = authoritative_modules.iter().map(|m| m.module_index).collect();

        for desc in authoritative_modules {
            let key = (device_id.to_string(), desc.module_index);
            let is_new = !inner.telemetry_by_key.contains_key(&key);
            let module = inner.telemetry_by_key.entry(key).or_default();

            if is_new {
                changes.push(format!(
                    "Module {} added (moduleId {})",
                    desc.module_index, desc.module_id
                ));
                module.module_id = Some(desc.module_id.clone());
            } else if module.module_id.as_deref() != Some(desc.module_id.as_str()) {
                changes.push(format!(
                    "Module {} replaced (moduleId changed from {:?} to {})",
                    desc.module_index, module.module_id, desc.module_id
                ));
                module.module_id = Some(desc.module_id.clone());
            }

            if let Some(u_total) = desc.u_total {
                if module.u_total != Some(u_total) {
                    changes.push(format!(
                        "Module {} uTotal changed from {:?} to {}",
                        desc.module_index, module.u_total, u_total
                    ));
                    module.u_total = Some(u_total);
                }
            }

            // fwVer is preserved if the authoritative input does not carry it.
            if let Some(fw_ver) = &desc.fw_ver {
                if module.fw_ver.as_deref() != Some(fw_ver.as_str()) {
                    changes.push(format!(
                        "Module {} firmware changed from {:?} to {}",
                        desc.module_index, module.fw_ver, fw_ver
                    ));
                    module.fw_ver = Some(fw_ver.clone());
                }
            }
        }

        for removed in previous_indices.iter().filter(|idx| !incoming_indices.contains(idx)) {
            inner.telemetry_by_key.remove(&(device_id.to_string(), *removed));
            changes.push(format!("Module {} removed", removed));
        }

        let device = inner.meta_by_device.entry(device_id.to_string()).or_default();
        device.active_modules = incoming_indices;
        device.active_modules.sort_unstable();

        changes
    }

    /// Field-wise patch of one module's identity/firmware, independent of
    /// `reconcile_metadata`'s whole-list replacement — used by
    /// `MODULE_INFO`/`DEV_MOD_INFO` handling, which updates modules named
    /// in the message without treating the message as the authoritative
    /// full module list the way `HEARTBEAT` is.
    pub fn upsert_module(
        &self,
        device_id: &str,
        module_index: u32,
        module_id: Option<String>,
        u_total: Option<u32>,
        fw_ver: Option<String>,
    ) -> Vec<String> {
        let mut inner = self.inner.lock();
        let module = Self::module_mut(&mut inner, device_id, module_index);
        let mut changes = Vec::new();

        if let Some(id) = module_id {
            if module.module_id.as_ref() != Some(&id) {
                changes.push(format!(
                    "Module {} moduleId changed from {:?} to {}",
                    module_index, module.module_id, id
                ));
                module.module_id = Some(id);
            }
        }
        if let Some(total) = u_total {
            if module.u_total != Some(total) {
                changes.push(format!(
                    "Module {} uTotal changed from {:?} to {}",
                    module_index, module.u_total, total
                ));
                module.u_total = Some(total);
            }
        }
        if let Some(fw) = fw_ver {
            if module.fw_ver.as_deref() != Some(fw.as_str()) {
                changes.push(format!(
                    "Module {} firmware changed from {:?} to {}",
                    module_index, module.fw_ver, fw
                ));
                module.fw_ver = Some(fw);
            }
        }

        let device = inner.meta_by_device.entry(device_id.to_string()).or_default();
        if !device.active_modules.contains(&module_index) {
            device.active_modules.push(module_index);
            device.active_modules.sort_unstable();
        }

        changes
    }

    /// Stamps a heartbeat for one module: `lastSeenHeartbeat = now`,
    /// `online = true`, creating the module entry if absent.
    pub fn update_heartbeat(
        &self,
        device_id: &str,
        module_index: u32,
        module_id: &str,
        u_total: u32,
    ) {
        let mut inner = self.inner.lock();
        let module = Self::module_mut(&mut inner, device_id, module_index);
        module.module_id = Some(module_id.to_string());
        module.u_total = Some(u_total);
        module.last_seen_heartbeat = Some(Utc::now());
        module.online = true;

        let device = inner.meta_by_device.entry(device_id.to_string()).or_default();
        device.online = true;
    }

    /// Field-wise merge of temp/hum slot readings; unchanged slots are
    /// left alone rather than overwritten with null.
    pub fn update_temp_hum(&self, device_id: &str, module_index: u32, slots: BTreeMap<u32, TempHumReading>) {
        let mut inner = self.inner.lock();
        let module = Self::module_mut(&mut inner, device_id, module_index);
        for (slot, reading) in slots {
            let entry = module.temp_hum.entry(slot).or_default();
            if reading.temp.is_some() {
                entry.temp = reading.temp;
            }
            if reading.hum.is_some() {
                entry.hum = reading.hum;
            }
        }
        module.last_seen_temp_hum = Some(Utc::now());
    }

    pub fn update_noise(&self, device_id: &str, module_index: u32, slots: BTreeMap<u32, f64>) {
        let mut inner = self.inner.lock();
        let module = Self::module_mut(&mut inner, device_id, module_index);
        for (slot, value) in slots {
            module.noise.insert(slot, value);
        }
        module.last_seen_noise = Some(Utc::now());
    }

    pub fn update_door(
        &self,
        device_id: &str,
        module_index: u32,
        single: Option<u8>,
        dual: Option<(Option<u8>, Option<u8>)>,
    ) {
        let mut inner = self.inner.lock();
        let module = Self::module_mut(&mut inner, device_id, module_index);
        if let Some(state) = single {
            module.door_state = Some(state);
        }
        if let Some((door1, door2)) = dual {
            if door1.is_some() {
                module.door1_state = door1;
            }
            if door2.is_some() {
                module.door2_state = door2;
            }
        }
        module.last_seen_door = Some(Utc::now());
    }

    /// Overwrite the cached RFID snapshot for a module, returning the
    /// previous snapshot (the caller diffs before calling this).
    pub fn update_rfid(&self, device_id: &str, module_index: u32, slots: Vec<RfidSlot>) -> Vec<RfidSlot> {
        let mut inner = self.inner.lock();
        let module = Self::module_mut(&mut inner, device_id, module_index);
        let previous = std::mem::replace(&mut module.rfid_snapshot, slots);
        module.last_seen_rfid = Some(Utc::now());
        previous
    }

    /// Compare the cached snapshot for (device, module) against an
    /// incoming one by `slotIndex`. A slot present in both with a
    /// different `tagId` counts as detach-of-old plus attach-of-new.
    /// Pure with respect to the passed-in `previous`/`incoming` pair —
    /// does not itself read or write the cache.
    pub fn diff_rfid(previous: &[RfidSlot], incoming: &[RfidSlot]) -> RfidDiff {
        let mut diff = RfidDiff::default();
        let prev_by_slot: HashMap<u32, &RfidSlot> =
            previous.iter().map(|s| (s.slot_index, s)).collect();
        let incoming_by_slot: HashMap<u32, &RfidSlot> =
            incoming.iter().map(|s| (s.slot_index, s)).collect();

        for (slot_index, incoming_slot) in &incoming_by_slot {
            match prev_by_slot.get(slot_index) {
                None => diff.attached.push((*incoming_slot).clone()),
                Some(prev_slot) if prev_slot.tag_id != incoming_slot.tag_id => {
                    diff.detached.push((*prev_slot).clone());
                    diff.attached.push((*incoming_slot).clone());
                }
                Some(_) => {}
            }
        }
        for (slot_index, prev_slot) in &prev_by_slot {
            if !incoming_by_slot.contains_key(slot_index) {
                diff.detached.push((*prev_slot).clone());
            }
        }
        diff
    }

    pub fn is_device_info_missing(&self, device_id: &str) -> bool {
        let inner = self.inner.lock();
        match inner.meta_by_device.get(device_id) {
            Some(device) => device.ip.is_none() || device.mac.is_none(),
            None => true,
        }
    }

    pub fn get_modules_missing_fw_ver(&self, device_id: &str) -> Vec<u32> {
        let inner = self.inner.lock();
        inner
            .telemetry_by_key
            .iter()
            .filter(|((dev, _), module)| dev == device_id && module.fw_ver.is_none())
            .map(|((_, idx), _)| *idx)
            .collect()
    }

    pub fn snapshot_device(&self, device_id: &str) -> Option<DeviceState> {
        self.inner.lock().meta_by_device.get(device_id).cloned()
    }

    pub fn snapshot_module(&self, device_id: &str, module_index: u32) -> Option<ModuleState> {
        self.inner
            .lock()
            .telemetry_by_key
            .get(&(device_id.to_string(), module_index))
            .cloned()
    }

    pub fn list_device_ids(&self) -> Vec<DeviceId> {
        self.inner.lock().meta_by_device.keys().cloned().collect()
    }

    pub fn list_modules(&self, device_id: &str) -> Vec<(u32, ModuleState)> {
        self.inner
            .lock()
            .telemetry_by_key
            .iter()
            .filter(|((dev, _), _)| dev == device_id)
            .map(|((_, idx), state)| (*idx, state.clone()))
            .collect()
    }

    /// Watchdog sweep (C8): mark every module whose last heartbeat is
    /// older than `heartbeat_timeout` as offline, then derive each
    /// device's `online` from whether any of its modules are still
    /// online. Does not delete entries or emit events.
    pub fn sweep_offline(&self, heartbeat_timeout: chrono::Duration) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        for module in inner.telemetry_by_key.values_mut() {
            if let Some(last) = module.last_seen_heartbeat {
                if now - last > heartbeat_timeout {
                    module.online = false;
                }
            }
        }

        let mut online_by_device: HashMap<DeviceId, bool> = HashMap::new();
        for ((device_id, _), module) in inner.telemetry_by_key.iter() {
            let entry = online_by_device.entry(device_id.clone()).or_insert(false);
            *entry = *entry || module.online;
        }
        for (device_id, device) in inner.meta_by_device.iter_mut() {
            device.online = online_by_device.get(device_id).copied().unwrap_or(false);
        }
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_metadata_reports_changes_then_is_idempotent() {
        let cache = StateCache::new();
        let patch = DevicePatch {
            ip: Some("192.168.0.2".into()),
            ..Default::default()
        };
        let changes = cache.upsert_metadata("dev1", patch.clone());
        assert_eq!(changes.len(), 1);

        // Re-applying the same patch yields no changes.
        let changes = cache.upsert_metadata("dev1", patch);
        assert!(changes.is_empty());
    }

    #[test]
    fn upsert_metadata_describes_ip_change() {
        let cache = StateCache::new();
        cache.upsert_metadata(
            "dev1",
            DevicePatch {
                ip: Some("192.168.0.2".into()),
                ..Default::default()
            },
        );
        let changes = cache.upsert_metadata(
            "dev1",
            DevicePatch {
                ip: Some("192.168.0.5".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            changes,
            vec!["Device IP changed from 192.168.0.2 to 192.168.0.5".to_string()]
        );
    }

    #[test]
    fn reconcile_metadata_is_idempotent() {
        let cache = StateCache::new();
        let modules = vec![
            ModuleDescriptor { module_index: 1, module_id: "100".into(), u_total: Some(6), fw_ver: None },
            ModuleDescriptor { module_index: 2, module_id: "200".into(), u_total: Some(12), fw_ver: None },
        ];
        let first = cache.reconcile_metadata("dev1", &modules);
        assert_eq!(first.len(), 2);

        let second = cache.reconcile_metadata("dev1", &modules);
        assert!(second.is_empty(), "second reconcile should be a no-op: {second:?}");
    }

    #[test]
    fn reconcile_metadata_preserves_fw_ver_when_omitted() {
        let cache = StateCache::new();
        cache.update_heartbeat("dev1", 1, "100", 6);
        cache.reconcile_metadata(
            "dev1",
            &[ModuleDescriptor { module_index: 1, module_id: "100".into(), u_total: None, fw_ver: Some("1.2".into()) }],
        );
        // Second reconcile omits fw_ver -- must not clear it.
        cache.reconcile_metadata(
            "dev1",
            &[ModuleDescriptor { module_index: 1, module_id: "100".into(), u_total: None, fw_ver: None }],
        );
        let module = cache.snapshot_module("dev1", 1).unwrap();
        assert_eq!(module.fw_ver.as_deref(), Some("1.2"));
    }

    #[test]
    fn reconcile_metadata_removes_modules_absent_from_list() {
        let cache = StateCache::new();
        cache.reconcile_metadata(
            "dev1",
            &[
                ModuleDescriptor { module_index: 1, module_id: "a".into(), u_total: None, fw_ver: None },
                ModuleDescriptor { module_index: 2, module_id: "b".into(), u_total: None, fw_ver: None },
            ],
        );
        let changes = cache.reconcile_metadata("dev1", &[]);
        assert!(changes.iter().any(|c| c.contains("Module 1 removed")));
        assert!(changes.iter().any(|c| c.contains("Module 2 removed")));
        assert!(cache.list_modules("dev1").is_empty());
    }

    #[test]
    fn diff_rfid_symmetric() {
        let a = vec![RfidSlot { slot_index: 1, tag_id: "t1".into(), alarm: false }];
        let b = vec![RfidSlot { slot_index: 1, tag_id: "t2".into(), alarm: false }];

        let a_to_b = StateCache::diff_rfid(&a, &b);
        let b_to_a = StateCache::diff_rfid(&b, &a);

        assert_eq!(a_to_b.attached, b_to_a.detached);
        assert_eq!(a_to_b.detached, b_to_a.attached);
    }

    #[test]
    fn diff_rfid_identical_snapshot_is_empty() {
        let a = vec![RfidSlot { slot_index: 1, tag_id: "t1".into(), alarm: false }];
        let diff = StateCache::diff_rfid(&a, &a);
        assert!(diff.attached.is_empty());
        assert!(diff.detached.is_empty());
    }

    #[test]
    fn diff_rfid_detects_single_removal() {
        let previous = vec![
            RfidSlot { slot_index: 1, tag_id: "t1".into(), alarm: false },
            RfidSlot { slot_index: 2, tag_id: "t2".into(), alarm: false },
        ];
        let incoming = vec![RfidSlot { slot_index: 1, tag_id: "t1".into(), alarm: false }];
        let diff = StateCache::diff_rfid(&previous, &incoming);
        assert!(diff.attached.is_empty());
        assert_eq!(diff.detached, vec![previous[1].clone()]);
    }

    #[test]
    fn is_device_info_missing_true_until_ip_and_mac_set() {
        let cache = StateCache::new();
        assert!(cache.is_device_info_missing("dev1"));
        cache.upsert_metadata("dev1", DevicePatch { ip: Some("1.2.3.4".into()), ..Default::default() });
        assert!(cache.is_device_info_missing("dev1"));
        cache.upsert_metadata("dev1", DevicePatch { mac: Some("AA:BB:CC:DD:EE:FF".into()), ..Default::default() });
        assert!(!cache.is_device_info_missing("dev1"));
    }

    #[test]
    fn upsert_module_reports_changes_then_is_idempotent() {
        let cache = StateCache::new();
        let changes = cache.upsert_module("dev1", 1, Some("100".into()), Some(6), Some("1.0".into()));
        assert_eq!(changes.len(), 3);
        let changes = cache.upsert_module("dev1", 1, Some("100".into()), Some(6), Some("1.0".into()));
        assert!(changes.is_empty());
        assert_eq!(cache.snapshot_device("dev1").unwrap().active_modules, vec![1]);
    }

    #[test]
    fn watchdog_sweep_marks_offline_without_deleting() {
        let cache = StateCache::new();
        cache.update_heartbeat("dev1", 1, "100", 6);
        cache.sweep_offline(chrono::Duration::seconds(-1));
        let module = cache.snapshot_module("dev1", 1).unwrap();
        assert!(!module.online);
    }
}

// Shared BLE adapter management
//
// Provides a singleton BLE manager + adapter used by both the BLE sensor
// backend and the one-shot device scan.

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BackendError, Result};

// ============================================================================
// Shared adapter state
// ============================================================================

pub struct BleAdapterState {
    manager: Option<Manager>,
    pub adapter: Option<Adapter>,
}

pub static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

/// Initialise the BLE manager and adapter if not already done, and return
/// a handle to the adapter. A host without a usable adapter is reported as
/// an unsupported transport rather than a connect failure.
pub async fn ensure_adapter() -> Result<Adapter> {
    let mut state = BLE_ADAPTER.lock().await;
    if let Some(adapter) = state.adapter.as_ref() {
        return Ok(adapter.clone());
    }
    let manager = Manager::new()
        .await
        .map_err(|e| BackendError::UnsupportedTransport(format!("BLE manager init failed: {e}")))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| BackendError::UnsupportedTransport(format!("Failed to list BLE adapters: {e}")))?;
    let adapter = adapters
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::UnsupportedTransport("No BLE adapter found".to_string()))?;
    state.adapter = Some(adapter.clone());
    state.manager = Some(manager);
    tracing::debug!("[ble] Adapter initialised");
    Ok(adapter)
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Find a GATT characteristic by service and characteristic UUID on a
/// connected peripheral.
pub fn find_characteristic(peripheral: &Peripheral, service_uuid: Uuid, uuid: Uuid) -> Option<Characteristic> {
    select_characteristic(peripheral.characteristics(), service_uuid, uuid)
}

/// The same characteristic UUID may appear under several services; only the
/// one inside `service_uuid` matches.
pub fn select_characteristic(
    characteristics: impl IntoIterator<Item = Characteristic>,
    service_uuid: Uuid,
    uuid: Uuid,
) -> Option<Characteristic> {
    characteristics
        .into_iter()
        .find(|c| c.service_uuid == service_uuid && c.uuid == uuid)
}

/// One scan result: peripheral, advertised name, signal strength
pub type ScanEntry<P> = (P, Option<String>, Option<i16>);

/// Peripherals seen during one scan, keyed by id. A peripheral first seen
/// without a name is re-examined on later polls until its name arrives
/// (often only in the scan response).
pub(crate) struct ScanLog<P> {
    entries: Vec<ScanEntry<P>>,
    index: HashMap<String, usize>,
}

impl<P> ScanLog<P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Nothing more to learn about `id`
    pub(crate) fn is_settled(&self, id: &str) -> bool {
        self.index
            .get(id)
            .is_some_and(|&i| self.entries[i].1.is_some())
    }

    /// Record one observation. Returns true if the peripheral is new or
    /// this observation supplied its name.
    pub(crate) fn observe(&mut self, id: String, peripheral: P, name: Option<String>, rssi: Option<i16>) -> bool {
        match self.index.get(&id) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                if entry.1.is_some() || name.is_none() {
                    return false;
                }
                let rssi = rssi.or(entry.2);
                *entry = (peripheral, name, rssi);
                true
            }
            None => {
                self.index.insert(id, self.entries.len());
                self.entries.push((peripheral, name, rssi));
                true
            }
        }
    }

    pub(crate) fn into_entries(self) -> Vec<ScanEntry<P>> {
        self.entries
    }
}

/// Run an unfiltered scan, polling the adapter's peripheral list every
/// `poll` until `timeout` elapses or `done` returns true for a peripheral.
///
/// No service filter is passed to the adapter: on macOS CoreBluetooth only
/// matches UUIDs in the primary advertisement, while many firmwares put
/// 128-bit service UUIDs in the scan response.
pub async fn scan_peripherals<F>(
    adapter: &Adapter,
    timeout: Duration,
    poll: Duration,
    mut done: F,
) -> Result<Vec<ScanEntry<Peripheral>>>
where
    F: FnMut(Option<&str>) -> bool,
{
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| BackendError::Connect(format!("Failed to start BLE scan: {e}")))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut log = ScanLog::new();

    'poll: loop {
        tokio::time::sleep(poll).await;

        if let Ok(peripherals) = adapter.peripherals().await {
            for peripheral in peripherals {
                let id = peripheral.id().to_string();
                if log.is_settled(&id) {
                    continue;
                }
                let props = match peripheral.properties().await.ok().flatten() {
                    Some(p) => p,
                    None => continue,
                };
                let name = props.local_name;
                let stop = done(name.as_deref());
                if log.observe(id, peripheral, name, props.rssi) && stop {
                    break 'poll;
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            break;
        }
    }

    let _ = adapter.stop_scan().await;
    Ok(log.into_entries())
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::CharPropFlags;
    use crate::config::{DEFAULT_NOTIFY_UUID, DEFAULT_SERVICE_UUID};

    fn characteristic(service_uuid: Uuid, uuid: Uuid) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            properties: CharPropFlags::NOTIFY,
            descriptors: Default::default(),
        }
    }

    #[test]
    fn test_name_arriving_on_later_poll_is_recorded() {
        let mut log: ScanLog<u8> = ScanLog::new();
        assert!(log.observe("AA".into(), 1, None, Some(-70)));
        assert!(!log.is_settled("AA"));
        // Same peripheral, still anonymous
        assert!(!log.observe("AA".into(), 1, None, None));

        assert!(log.observe("AA".into(), 1, Some("CardinalGrip_S3".into()), None));
        assert!(log.is_settled("AA"));
        assert!(!log.observe("AA".into(), 1, Some("Renamed".into()), Some(-40)));

        let entries = log.into_entries();
        assert_eq!(entries, vec![(1, Some("CardinalGrip_S3".to_string()), Some(-70))]);
    }

    #[test]
    fn test_characteristic_must_sit_in_configured_service() {
        let other_service = Uuid::from_u128(0x0000180F_0000_1000_8000_00805F9B34FB);
        let found = vec![
            characteristic(other_service, DEFAULT_NOTIFY_UUID),
            characteristic(DEFAULT_SERVICE_UUID, DEFAULT_NOTIFY_UUID),
        ];

        let picked = select_characteristic(found.clone(), DEFAULT_SERVICE_UUID, DEFAULT_NOTIFY_UUID).unwrap();
        assert_eq!(picked.service_uuid, DEFAULT_SERVICE_UUID);

        let overridden = select_characteristic(found.clone(), other_service, DEFAULT_NOTIFY_UUID).unwrap();
        assert_eq!(overridden.service_uuid, other_service);

        let absent = Uuid::from_u128(0x12345678_0000_1000_8000_00805F9B34FB);
        assert!(select_characteristic(found, absent, DEFAULT_NOTIFY_UUID).is_none());
    }
}

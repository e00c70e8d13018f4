//! Collector capabilities and the process-wide registry.
//!
//! A collector is an opaque capability: a name and a `collect()` that yields an
//! arbitrary JSON payload (schema owned by the collector). The built-ins here
//! are the fast sysinfo-backed set; anything with unpredictable latency should
//! go through the non-blocking scheduler instead of being marked `fast`.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use sysinfo::{
    Components, CpuRefreshKind, Disks, MemoryRefreshKind, Networks, RefreshKind, System,
};

pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fast collectors are bounded and may be invoked inline on the serving
    /// path; everything else is scheduler-mediated.
    fn fast(&self) -> bool {
        false
    }

    fn collect(&self) -> Result<Value>;
}

/// Map external module aliases to canonical collector names.
pub fn normalize_module(name: &str) -> String {
    let n = name.trim().to_ascii_lowercase();
    if n == "mem" {
        "memory".to_string()
    } else {
        n
    }
}

/// Ordered set of registered collectors; order defines payload assembly order.
pub struct CollectorRegistry {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new(collectors: Vec<Arc<dyn Collector>>) -> Self {
        Self { collectors }
    }

    /// Registry with the built-in sysinfo collectors. The System handle is
    /// shared between cpu and memory so usage deltas accumulate in one place.
    pub fn with_builtins() -> Self {
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());
        let sys = Arc::new(Mutex::new(System::new_with_specifics(refresh)));
        Self::new(vec![
            Arc::new(CpuCollector { sys: sys.clone() }),
            Arc::new(MemoryCollector { sys }),
            Arc::new(DiskCollector {
                disks: Mutex::new(Disks::new_with_refreshed_list()),
            }),
            Arc::new(NetworkCollector {
                nets: Mutex::new(Networks::new_with_refreshed_list()),
            }),
            Arc::new(SensorCollector {
                components: Mutex::new(Components::new_with_refreshed_list()),
            }),
        ])
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.iter().find(|c| c.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Collector>> {
        self.collectors.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }
}

/// Live cpu/memory reading for priming notifications and synthetic history
/// rows. Failures are tolerated field-wise.
pub fn sample_cpu_mem(registry: &CollectorRegistry) -> (Option<f64>, Option<(i64, i64)>) {
    let cpu = registry
        .get("cpu")
        .and_then(|c| c.collect().ok())
        .and_then(|v| v.get("usage_percent").and_then(Value::as_f64));
    let mem = registry
        .get("memory")
        .and_then(|c| c.collect().ok())
        .and_then(|v| {
            let total = v.get("total_mb")?.as_i64()?;
            let used = v.get("used_mb")?.as_i64()?;
            Some((total, used))
        });
    (cpu, mem)
}

// ---------- Built-in collectors ----------

struct CpuCollector {
    sys: Arc<Mutex<System>>,
}

impl Collector for CpuCollector {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn fast(&self) -> bool {
        true
    }

    fn collect(&self) -> Result<Value> {
        let mut sys = self.sys.lock().map_err(|_| anyhow::anyhow!("sys poisoned"))?;
        sys.refresh_cpu_usage();
        let per_core: Vec<f32> = sys.cpus().iter().map(|c| c.cpu_usage()).collect();
        Ok(json!({
            "usage_percent": sys.global_cpu_usage() as f64,
            "per_core": per_core,
        }))
    }
}

struct MemoryCollector {
    sys: Arc<Mutex<System>>,
}

impl Collector for MemoryCollector {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn fast(&self) -> bool {
        true
    }

    fn collect(&self) -> Result<Value> {
        let mut sys = self.sys.lock().map_err(|_| anyhow::anyhow!("sys poisoned"))?;
        sys.refresh_memory();
        let total = sys.total_memory();
        let used = total.saturating_sub(sys.available_memory());
        Ok(json!({
            "total_mb": total / (1024 * 1024),
            "used_mb": used / (1024 * 1024),
            "swap_total_mb": sys.total_swap() / (1024 * 1024),
            "swap_used_mb": sys.used_swap() / (1024 * 1024),
        }))
    }
}

struct DiskCollector {
    disks: Mutex<Disks>,
}

impl Collector for DiskCollector {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn collect(&self) -> Result<Value> {
        let mut disks = self
            .disks
            .lock()
            .map_err(|_| anyhow::anyhow!("disks poisoned"))?;
        disks.refresh(false); // don't drop missing disks
        let list: Vec<Value> = disks
            .iter()
            .map(|d| {
                json!({
                    "name": d.name().to_string_lossy(),
                    "total": d.total_space(),
                    "available": d.available_space(),
                })
            })
            .collect();
        Ok(json!({ "disks": list }))
    }
}

struct NetworkCollector {
    nets: Mutex<Networks>,
}

impl Collector for NetworkCollector {
    fn name(&self) -> &'static str {
        "network"
    }

    fn collect(&self) -> Result<Value> {
        let mut nets = self
            .nets
            .lock()
            .map_err(|_| anyhow::anyhow!("nets poisoned"))?;
        nets.refresh(false);
        let list: Vec<Value> = nets
            .iter()
            .map(|(name, data)| {
                // cumulative totals since start; clients diff to get rates
                json!({
                    "name": name,
                    "received": data.total_received(),
                    "transmitted": data.total_transmitted(),
                })
            })
            .collect();
        Ok(json!({ "interfaces": list }))
    }
}

fn temp_enabled() -> bool {
    static ON: OnceCell<bool> = OnceCell::new();
    *ON.get_or_init(|| {
        std::env::var("HOSTPULSE_TEMP")
            .map(|v| v != "0")
            .unwrap_or(true)
    })
}

struct SensorCollector {
    components: Mutex<Components>,
}

impl Collector for SensorCollector {
    fn name(&self) -> &'static str {
        "sensors"
    }

    fn collect(&self) -> Result<Value> {
        if !temp_enabled() {
            return Ok(json!({ "cpu_temp_c": null, "sensors": [] }));
        }
        let mut components = self
            .components
            .lock()
            .map_err(|_| anyhow::anyhow!("components poisoned"))?;
        components.refresh(false);
        let cpu_temp = components.iter().find_map(|c| {
            let l = c.label().to_ascii_lowercase();
            if l.contains("cpu") || l.contains("package") || l.contains("tctl") || l.contains("tdie")
            {
                c.temperature()
            } else {
                None
            }
        });
        let sensors: Vec<Value> = components
            .iter()
            .filter_map(|c| {
                c.temperature()
                    .map(|t| json!({ "label": c.label(), "temp_c": t }))
            })
            .collect();
        Ok(json!({ "cpu_temp_c": cpu_temp, "sensors": sensors }))
    }
}

//! CPU hotplug through the Linux sysfs interface.
//!
//! Reads `/sys/devices/system/cpu/online` for the online set, the
//! `cpuN/nodeM` link for NUMA placement and `/proc/cpuinfo` for the local
//! APIC ids. Offlining writes `0` to `cpuN/online`.

use super::{CpuHotplug, HostCpu};
use cohost_shared::errors::{CohostError, CohostResult};
use cohost_shared::NodeId;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SysfsCpuHotplug {
    root: PathBuf,
}

impl Default for SysfsCpuHotplug {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsCpuHotplug {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Resolve every path relative to `root` instead of `/`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn cpu_dir(&self) -> PathBuf {
        self.root.join("sys/devices/system/cpu")
    }

    fn apic_ids(&self) -> CohostResult<HashMap<u32, u32>> {
        let cpuinfo = fs::read_to_string(self.root.join("proc/cpuinfo"))?;
        Ok(parse_apic_ids(&cpuinfo))
    }

    fn node_of(&self, logical_id: u32) -> NodeId {
        let dir = self.cpu_dir().join(format!("cpu{}", logical_id));
        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("node"))
                    .and_then(|n| n.parse().ok())
            })
            .next()
            .unwrap_or(0)
    }
}

impl CpuHotplug for SysfsCpuHotplug {
    fn online_cpus(&self) -> CohostResult<Vec<HostCpu>> {
        let online = fs::read_to_string(self.cpu_dir().join("online"))?;
        let ids = parse_cpu_list(&online)?;
        let apic = self.apic_ids()?;

        ids.into_iter()
            .map(|logical_id| {
                let hw_id = apic.get(&logical_id).copied().ok_or_else(|| {
                    CohostError::Internal(format!("no apicid for cpu {}", logical_id))
                })?;
                Ok(HostCpu {
                    logical_id,
                    hw_id,
                    node: self.node_of(logical_id),
                })
            })
            .collect()
    }

    fn set_online(&self, logical_id: u32, online: bool) -> CohostResult<()> {
        let path = self.cpu_dir().join(format!("cpu{}/online", logical_id));
        write_flag(&path, online)?;
        tracing::debug!(cpu = logical_id, online, "cpu hotplug");
        Ok(())
    }
}

fn write_flag(path: &Path, value: bool) -> CohostResult<()> {
    fs::write(path, if value { "1" } else { "0" }).map_err(|e| {
        CohostError::Internal(format!("failed to write {}: {}", path.display(), e))
    })
}

/// Parse a kernel cpu list such as `0-3,6,8-9`.
pub(crate) fn parse_cpu_list(list: &str) -> CohostResult<Vec<u32>> {
    let mut ids = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        let bad = || CohostError::Validation(format!("malformed cpu list entry '{}'", part));
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().map_err(|_| bad())?;
                let hi: u32 = hi.trim().parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                ids.extend(lo..=hi);
            }
            None => ids.push(part.trim().parse().map_err(|_| bad())?),
        }
    }
    Ok(ids)
}

fn parse_apic_ids(cpuinfo: &str) -> HashMap<u32, u32> {
    let mut map = HashMap::new();
    let mut processor = None;
    for line in cpuinfo.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => processor = value.trim().parse().ok(),
            "apicid" => {
                if let (Some(p), Ok(apic)) = (processor, value.trim().parse()) {
                    map.insert(p, apic);
                }
            }
            _ => {}
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_tree(online: &str, cpus: &[(u32, u32, u32)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let cpu_dir = dir.path().join("sys/devices/system/cpu");
        fs::create_dir_all(&cpu_dir).unwrap();
        fs::write(cpu_dir.join("online"), online).unwrap();

        let mut cpuinfo = String::new();
        for (logical, apic, node) in cpus {
            let d = cpu_dir.join(format!("cpu{}", logical));
            fs::create_dir_all(d.join(format!("node{}", node))).unwrap();
            fs::write(d.join("online"), "1").unwrap();
            cpuinfo.push_str(&format!(
                "processor\t: {}\nvendor_id\t: GenuineIntel\napicid\t\t: {}\n\n",
                logical, apic
            ));
        }
        fs::create_dir_all(dir.path().join("proc")).unwrap();
        fs::write(dir.path().join("proc/cpuinfo"), cpuinfo).unwrap();
        dir
    }

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3,6\n").unwrap(), vec![0, 1, 2, 3, 6]);
        assert_eq!(parse_cpu_list("5").unwrap(), vec![5]);
        assert!(parse_cpu_list("").unwrap().is_empty());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a").is_err());
    }

    #[test]
    fn test_online_cpus_reads_apic_and_node() {
        let dir = fake_tree("0-2", &[(0, 0, 0), (1, 2, 0), (2, 4, 1)]);
        let hotplug = SysfsCpuHotplug::with_root(dir.path());

        let cpus = hotplug.online_cpus().unwrap();
        assert_eq!(cpus.len(), 3);
        assert_eq!(
            cpus[2],
            HostCpu {
                logical_id: 2,
                hw_id: 4,
                node: 1
            }
        );
    }

    #[test]
    fn test_set_online_writes_flag() {
        let dir = fake_tree("0-1", &[(0, 0, 0), (1, 1, 0)]);
        let hotplug = SysfsCpuHotplug::with_root(dir.path());

        hotplug.set_online(1, false).unwrap();
        let flag = dir.path().join("sys/devices/system/cpu/cpu1/online");
        assert_eq!(fs::read_to_string(&flag).unwrap(), "0");

        assert!(hotplug.set_online(9, false).is_err());
    }
}

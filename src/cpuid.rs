//! CPU identification
//!
//! Reads the CPUID leaves of every logical processor (pinned with
//! [`AffinityGuard`]), decodes vendor, family/model/stepping and brand, and
//! resolves the package / core / thread topology from the APIC id.

#[cfg(target_arch = "x86_64")]
use crate::affinity::AffinityGuard;
use crate::affinity::logical_processor_count;
use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw CPUID output registers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuidRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidRegs {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }
}

/// Source of CPUID data for a given logical processor
pub trait CpuidSource: Send + Sync {
    fn logical_processors(&self) -> usize;

    /// Execute CPUID on `thread`; `None` when the processor is unreachable
    fn cpuid(&self, thread: usize, leaf: u32, subleaf: u32) -> Option<CpuidRegs>;
}

/// The `cpuid` instruction, executed with the thread pinned
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCpuid;

impl CpuidSource for NativeCpuid {
    fn logical_processors(&self) -> usize {
        logical_processor_count()
    }

    #[cfg(target_arch = "x86_64")]
    fn cpuid(&self, thread: usize, leaf: u32, subleaf: u32) -> Option<CpuidRegs> {
        let _guard = match AffinityGuard::pin(thread) {
            Ok(guard) => guard,
            Err(e) => {
                log::debug!("Cannot pin to cpu {}: {}", thread, e);
                return None;
            }
        };
        // SAFETY: cpuid is available on every x86_64 processor
        let r = unsafe { std::arch::x86_64::__cpuid_count(leaf, subleaf) };
        Some(CpuidRegs::new(r.eax, r.ebx, r.ecx, r.edx))
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn cpuid(&self, _thread: usize, _leaf: u32, _subleaf: u32) -> Option<CpuidRegs> {
        None
    }
}

/// Processor vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::Intel => write!(f, "Intel"),
            Vendor::Amd => write!(f, "AMD"),
            Vendor::Unknown => write!(f, "Unknown"),
        }
    }
}

const EXTENDED_BASE: u32 = 0x8000_0000;
const MAX_STANDARD_LEAVES: u32 = 0x20;
const MAX_EXTENDED_LEAVES: u32 = 0x20;

/// Decoded identification of one logical processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuidData {
    pub thread: usize,
    pub vendor: Vendor,
    pub vendor_string: String,
    pub brand: String,
    pub name: String,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    pub apic_id: u32,
    pub processor_id: u32,
    pub core_id: u32,
    pub thread_id: u32,
    /// Standard leaves 0..n
    pub data: Vec<CpuidRegs>,
    /// Extended leaves 0x8000_0000..n
    pub ext_data: Vec<CpuidRegs>,
}

/// `ceil(log2(x))` for topology mask widths
fn next_log2(x: u32) -> u32 {
    if x <= 1 {
        return 0;
    }
    32 - (x - 1).leading_zeros()
}

fn regs_to_string(words: &[u32]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .trim_matches(char::from(0))
        .to_string()
}

/// Marketing noise stripped from brand strings
const NAME_NOISE: &[&str] = &[
    "(R)",
    "(TM)",
    "(tm)",
    "CPU",
    "Dual-Core Processor",
    "Triple-Core Processor",
    "Quad-Core Processor",
    "Six-Core Processor",
    "Eight-Core Processor",
    "6-Core Processor",
    "8-Core Processor",
    "12-Core Processor",
    "16-Core Processor",
    "24-Core Processor",
    "32-Core Processor",
    "64-Core Processor",
    "Processor",
];

fn clean_name(brand: &str) -> String {
    let mut name = brand.to_string();
    if let Some(pos) = name.find('@') {
        name.truncate(pos);
    }
    for noise in NAME_NOISE {
        name = name.replace(noise, "");
    }
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl CpuidData {
    /// Read and decode CPUID for `thread`
    pub fn read(source: &dyn CpuidSource, thread: usize) -> Option<Self> {
        let leaf0 = source.cpuid(thread, 0, 0)?;
        let max_leaf = leaf0.eax.min(MAX_STANDARD_LEAVES);
        let vendor_string = regs_to_string(&[leaf0.ebx, leaf0.edx, leaf0.ecx]);
        let vendor = match vendor_string.as_str() {
            "GenuineIntel" => Vendor::Intel,
            "AuthenticAMD" | "HygonGenuine" => Vendor::Amd,
            _ => Vendor::Unknown,
        };

        let data: Vec<CpuidRegs> = (0..=max_leaf)
            .map(|leaf| source.cpuid(thread, leaf, 0).unwrap_or_default())
            .collect();

        let max_ext = source
            .cpuid(thread, EXTENDED_BASE, 0)
            .map(|r| r.eax)
            .filter(|&eax| eax >= EXTENDED_BASE)
            .map(|eax| (eax - EXTENDED_BASE).min(MAX_EXTENDED_LEAVES))
            .unwrap_or(0);
        let ext_data: Vec<CpuidRegs> = (0..=max_ext)
            .map(|leaf| {
                source
                    .cpuid(thread, EXTENDED_BASE + leaf, 0)
                    .unwrap_or_default()
            })
            .collect();

        let brand = if ext_data.len() > 4 {
            let words: Vec<u32> = ext_data[2..=4]
                .iter()
                .flat_map(|r| [r.eax, r.ebx, r.ecx, r.edx])
                .collect();
            regs_to_string(&words).trim().to_string()
        } else {
            String::new()
        };
        let name = clean_name(&brand);

        let leaf1 = data.get(1).copied().unwrap_or_default();
        let family = ((leaf1.eax & 0x0FF0_0000) >> 20) + ((leaf1.eax & 0x0F00) >> 8);
        let model = ((leaf1.eax & 0x0F_0000) >> 12) + ((leaf1.eax & 0xF0) >> 4);
        let stepping = leaf1.eax & 0x0F;
        let apic_id = (leaf1.ebx >> 24) & 0xFF;

        let max_core_and_thread = ((leaf1.ebx >> 16) & 0xFF).max(1);
        let max_core = match vendor {
            Vendor::Intel if data.len() > 4 => {
                let leaf4 = source.cpuid(thread, 4, 0).unwrap_or_default();
                ((leaf4.eax >> 26) & 0x3F) + 1
            }
            Vendor::Amd if ext_data.len() > 8 => {
                let mut cores = (ext_data[8].ecx & 0xFF) + 1;
                if family >= 0x17 && ext_data.len() > 0x1E {
                    let threads_per_core = ((ext_data[0x1E].ebx >> 8) & 0xFF) + 1;
                    cores = (cores / threads_per_core).max(1);
                }
                cores
            }
            _ => max_core_and_thread,
        };

        let thread_mask_width = next_log2((max_core_and_thread / max_core).max(1));
        let core_mask_width = next_log2(max_core);
        let processor_id = apic_id >> (core_mask_width + thread_mask_width);
        let core_id = (apic_id >> thread_mask_width) - (processor_id << core_mask_width);
        let thread_id = apic_id
            - (processor_id << (core_mask_width + thread_mask_width))
            - (core_id << thread_mask_width);

        trace!(
            "cpu {}: {} family {:#x} model {:#x} stepping {} apic {} -> package {} core {} thread {}",
            thread,
            vendor,
            family,
            model,
            stepping,
            apic_id,
            processor_id,
            core_id,
            thread_id
        );

        Some(Self {
            thread,
            vendor,
            vendor_string,
            brand,
            name,
            family,
            model,
            stepping,
            apic_id,
            processor_id,
            core_id,
            thread_id,
            data,
            ext_data,
        })
    }

    /// Standard leaf `leaf`, if present
    pub fn leaf(&self, leaf: usize) -> Option<CpuidRegs> {
        self.data.get(leaf).copied()
    }

    /// Extended leaf `0x8000_0000 + leaf`, if present
    pub fn ext_leaf(&self, leaf: usize) -> Option<CpuidRegs> {
        self.ext_data.get(leaf).copied()
    }
}

/// Threads of one physical core
pub type CoreThreads = Vec<CpuidData>;

/// Read every logical processor and group into packages of cores of threads
pub fn read_topology(source: &dyn CpuidSource) -> Vec<Vec<CoreThreads>> {
    let threads: Vec<CpuidData> = (0..source.logical_processors())
        .filter_map(|t| CpuidData::read(source, t))
        .collect();
    group_topology(threads)
}

pub fn group_topology(threads: Vec<CpuidData>) -> Vec<Vec<CoreThreads>> {
    let mut packages: Vec<(u32, Vec<(u32, CoreThreads)>)> = Vec::new();
    for t in threads {
        let package = match packages.iter_mut().find(|(id, _)| *id == t.processor_id) {
            Some((_, cores)) => cores,
            None => {
                packages.push((t.processor_id, Vec::new()));
                match packages.last_mut() {
                    Some((_, cores)) => cores,
                    None => continue,
                }
            }
        };
        match package.iter_mut().find(|(id, _)| *id == t.core_id) {
            Some((_, threads)) => threads.push(t),
            None => package.push((t.core_id, vec![t])),
        }
    }
    packages.sort_by_key(|(id, _)| *id);
    packages
        .into_iter()
        .map(|(_, mut cores)| {
            cores.sort_by_key(|(id, _)| *id);
            cores.into_iter().map(|(_, threads)| threads).collect()
        })
        .collect()
}

/// Human-readable CPUID dump for the diagnostic report
pub fn report(package: &[CoreThreads]) -> String {
    use std::fmt::Write as _;
    let mut r = String::new();
    let Some(first) = package.first().and_then(|c| c.first()) else {
        return r;
    };
    let _ = writeln!(r, "Processor: {}", first.brand);
    let _ = writeln!(r, "Vendor: {}", first.vendor_string);
    let _ = writeln!(
        r,
        "Family: {:#04x}  Model: {:#04x}  Stepping: {}",
        first.family, first.model, first.stepping
    );
    for core in package {
        for t in core {
            let _ = writeln!(
                r,
                "  cpu {:>3}  apic {:>3}  package {}  core {:>2}  thread {}",
                t.thread, t.apic_id, t.processor_id, t.core_id, t.thread_id
            );
        }
    }
    let _ = writeln!(r, "CPUID leaves:");
    for (i, regs) in first.data.iter().enumerate() {
        let _ = writeln!(
            r,
            "  {:08X}  {:08X} {:08X} {:08X} {:08X}",
            i, regs.eax, regs.ebx, regs.ecx, regs.edx
        );
    }
    for (i, regs) in first.ext_data.iter().enumerate() {
        let _ = writeln!(
            r,
            "  {:08X}  {:08X} {:08X} {:08X} {:08X}",
            EXTENDED_BASE as usize + i,
            regs.eax,
            regs.ebx,
            regs.ecx,
            regs.edx
        );
    }
    r
}

/// Synthetic CPUID tables, one leaf map per logical processor
#[derive(Debug, Clone, Default)]
pub struct StaticCpuid {
    threads: Vec<std::collections::HashMap<(u32, u32), CpuidRegs>>,
}

impl StaticCpuid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe a processor by vendor string, brand and leaf-1 signature
    ///
    /// Generates `threads` logical processors with sequential APIC ids, two
    /// threads per core when `smt` is set.
    pub fn processor(vendor: &str, brand: &str, signature: u32, threads: usize, smt: bool) -> Self {
        let vendor_bytes = {
            let mut b = [0u8; 12];
            for (i, c) in vendor.bytes().take(12).enumerate() {
                b[i] = c;
            }
            b
        };
        let word = |i: usize| u32::from_le_bytes([vendor_bytes[i], vendor_bytes[i + 1], vendor_bytes[i + 2], vendor_bytes[i + 3]]);

        let mut brand_bytes = [0u8; 48];
        for (i, c) in brand.bytes().take(47).enumerate() {
            brand_bytes[i] = c;
        }
        let brand_word = |i: usize| {
            u32::from_le_bytes([
                brand_bytes[i],
                brand_bytes[i + 1],
                brand_bytes[i + 2],
                brand_bytes[i + 3],
            ])
        };

        let per_core = if smt { 2u32 } else { 1 };
        let cores = (threads as u32 / per_core).max(1);
        let logical = cores * per_core;
        let is_intel = vendor == "GenuineIntel";

        let mut out = Self::new();
        for t in 0..threads {
            let mut leaves = std::collections::HashMap::new();
            leaves.insert((0, 0), CpuidRegs::new(6, word(0), word(8), word(4)));
            leaves.insert(
                (1, 0),
                CpuidRegs::new(signature, (t as u32) << 24 | logical.next_power_of_two() << 16, 0, 0x10),
            );
            if is_intel {
                leaves.insert(
                    (4, 0),
                    CpuidRegs::new((cores.next_power_of_two() - 1) << 26, 0, 0, 0),
                );
            }
            leaves.insert((6, 0), CpuidRegs::new(0x40 | 0x01, 0, 0, 0));
            leaves.insert((EXTENDED_BASE, 0), CpuidRegs::new(EXTENDED_BASE + 8, 0, 0, 0));
            for (n, leaf) in (2u32..=4).enumerate() {
                let o = n * 16;
                leaves.insert(
                    (EXTENDED_BASE + leaf, 0),
                    CpuidRegs::new(brand_word(o), brand_word(o + 4), brand_word(o + 8), brand_word(o + 12)),
                );
            }
            leaves.insert((EXTENDED_BASE + 7, 0), CpuidRegs::new(0, 0, 0, 1));
            if !is_intel {
                leaves.insert(
                    (EXTENDED_BASE + 8, 0),
                    CpuidRegs::new(0, 0, cores.next_power_of_two() - 1, 0),
                );
            }
            out.threads.push(leaves);
        }
        out
    }

    /// Override one leaf on every thread
    pub fn with_leaf(mut self, leaf: u32, regs: CpuidRegs) -> Self {
        for t in &mut self.threads {
            t.insert((leaf, 0), regs);
        }
        self
    }
}

impl CpuidSource for StaticCpuid {
    fn logical_processors(&self) -> usize {
        self.threads.len()
    }

    fn cpuid(&self, thread: usize, leaf: u32, subleaf: u32) -> Option<CpuidRegs> {
        let t = self.threads.get(thread)?;
        Some(t.get(&(leaf, subleaf)).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_log2() {
        assert_eq!(next_log2(0), 0);
        assert_eq!(next_log2(1), 0);
        assert_eq!(next_log2(2), 1);
        assert_eq!(next_log2(3), 2);
        assert_eq!(next_log2(8), 3);
    }

    #[test]
    fn test_decode_intel_signature() {
        // Alder Lake: family 6, extended model 9, model 7
        let source = StaticCpuid::processor(
            "GenuineIntel",
            "12th Gen Intel(R) Core(TM) i7-12700K",
            0x0009_0672,
            4,
            true,
        );
        let cpu = CpuidData::read(&source, 0).unwrap();
        assert_eq!(cpu.vendor, Vendor::Intel);
        assert_eq!(cpu.family, 6);
        assert_eq!(cpu.model, 0x97);
        assert_eq!(cpu.stepping, 2);
        assert_eq!(cpu.name, "12th Gen Intel Core i7-12700K");
    }

    #[test]
    fn test_topology_smt() {
        let source = StaticCpuid::processor("GenuineIntel", "Test", 0x0009_0672, 8, true);
        let packages = read_topology(&source);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].len(), 4);
        assert!(packages[0].iter().all(|core| core.len() == 2));
        assert_eq!(packages[0][1][0].thread, 2);
        assert_eq!(packages[0][1][1].thread_id, 1);
    }

    #[test]
    fn test_topology_amd_no_smt() {
        let source = StaticCpuid::processor("AuthenticAMD", "AMD Athlon 64 X2", 0x0004_0FB2, 2, false);
        let packages = read_topology(&source);
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].len(), 2);
        let cpu = &packages[0][0][0];
        assert_eq!(cpu.vendor, Vendor::Amd);
        assert_eq!(cpu.family, 0x0F);
        assert_eq!(cpu.model, 0x4B);
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(
            clean_name("Intel(R) Core(TM) i7-4770 CPU @ 3.40GHz"),
            "Intel Core i7-4770"
        );
        assert_eq!(
            clean_name("AMD Ryzen 7 1800X Eight-Core Processor"),
            "AMD Ryzen 7 1800X"
        );
    }
}

//! Problem sizes and execution plans
//!
//! A sweep is an ordered list of FCC lattice sizes, each optionally carrying
//! a precomputed execution plan. Everything is validated when it is built,
//! so the driver never sees a zero-sized lattice or a negative skin.

use crate::error::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Atoms per FCC unit cell.
const FCC_BASIS: u64 = 4;

/// Lattice replication counts along x, y, z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u32; 3]", into = "[u32; 3]")]
pub struct LatticeSize {
    nx: u32,
    ny: u32,
    nz: u32,
}

impl LatticeSize {
    pub fn new(nx: u32, ny: u32, nz: u32) -> Result<Self> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(DriverError::Config(format!(
                "lattice size must be positive, got {nx}x{ny}x{nz}"
            )));
        }
        Ok(Self { nx, ny, nz })
    }

    pub fn nx(&self) -> u32 {
        self.nx
    }

    pub fn ny(&self) -> u32 {
        self.ny
    }

    pub fn nz(&self) -> u32 {
        self.nz
    }

    pub fn cells(&self) -> u64 {
        u64::from(self.nx) * u64::from(self.ny) * u64::from(self.nz)
    }

    /// Number of atoms on an FCC lattice of this size.
    pub fn fcc_atoms(&self) -> u64 {
        FCC_BASIS * self.cells()
    }
}

impl TryFrom<[u32; 3]> for LatticeSize {
    type Error = DriverError;

    fn try_from([nx, ny, nz]: [u32; 3]) -> Result<Self> {
        Self::new(nx, ny, nz)
    }
}

impl From<LatticeSize> for [u32; 3] {
    fn from(size: LatticeSize) -> Self {
        [size.nx, size.ny, size.nz]
    }
}

impl fmt::Display for LatticeSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.nx, self.ny, self.nz)
    }
}

/// Neighbor-list construction algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborListAlgorithm {
    /// O(N^2) all-pairs update
    #[serde(rename = "N squared")]
    NSquared,
    /// O(N) cell-linked lists
    #[serde(rename = "linked lists")]
    LinkedLists,
}

impl FromStr for NeighborListAlgorithm {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|&c| !matches!(c, '_' | '-' | ' ' | '\t'))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "nsquared" => Ok(Self::NSquared),
            "linkedlists" => Ok(Self::LinkedLists),
            other => Err(DriverError::Config(format!(
                "unknown neighbor-list algorithm {other:?}"
            ))),
        }
    }
}

/// Engine tuning parameters for one problem size.
///
/// Serialized with the engine's own key names (`pb`, `tp`, `UtilizeNIII`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawComputePlan", into = "RawComputePlan")]
pub struct ComputePlan {
    block_size: u32,
    threads_per_row: u32,
    skin: f64,
    algorithm: NeighborListAlgorithm,
    gridsync: bool,
    newton3: bool,
}

impl ComputePlan {
    pub fn new(
        block_size: u32,
        threads_per_row: u32,
        skin: f64,
        algorithm: NeighborListAlgorithm,
        gridsync: bool,
        newton3: bool,
    ) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(DriverError::Config(format!(
                "block size must be a power of two, got {block_size}"
            )));
        }
        if threads_per_row == 0 {
            return Err(DriverError::Config("thread count must be positive".into()));
        }
        if !skin.is_finite() || skin <= 0.0 {
            return Err(DriverError::Config(format!(
                "skin distance must be positive, got {skin}"
            )));
        }
        Ok(Self {
            block_size,
            threads_per_row,
            skin,
            algorithm,
            gridsync,
            newton3,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn threads_per_row(&self) -> u32 {
        self.threads_per_row
    }

    pub fn skin(&self) -> f64 {
        self.skin
    }

    pub fn algorithm(&self) -> NeighborListAlgorithm {
        self.algorithm
    }

    pub fn gridsync(&self) -> bool {
        self.gridsync
    }

    /// Whether Newton's third law is used to halve pair computations.
    pub fn newton3(&self) -> bool {
        self.newton3
    }
}

#[derive(Serialize, Deserialize)]
struct RawComputePlan {
    pb: u32,
    tp: u32,
    skin: f64,
    nblist: NeighborListAlgorithm,
    gridsync: bool,
    #[serde(rename = "UtilizeNIII")]
    utilize_n3: bool,
}

impl TryFrom<RawComputePlan> for ComputePlan {
    type Error = DriverError;

    fn try_from(raw: RawComputePlan) -> Result<Self> {
        ComputePlan::new(raw.pb, raw.tp, raw.skin, raw.nblist, raw.gridsync, raw.utilize_n3)
    }
}

impl From<ComputePlan> for RawComputePlan {
    fn from(plan: ComputePlan) -> Self {
        Self {
            pb: plan.block_size,
            tp: plan.threads_per_row,
            skin: plan.skin,
            nblist: plan.algorithm,
            gridsync: plan.gridsync,
            utilize_n3: plan.newton3,
        }
    }
}

/// One entry of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkCase {
    pub size: LatticeSize,
    pub plan: Option<ComputePlan>,
}

/// Ordered, non-empty list of problem sizes to benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkConfiguration {
    cases: Vec<BenchmarkCase>,
}

impl BenchmarkConfiguration {
    pub fn new(cases: Vec<BenchmarkCase>) -> Result<Self> {
        if cases.is_empty() {
            return Err(DriverError::Config("benchmark configuration is empty".into()));
        }
        Ok(Self { cases })
    }

    /// Sizes without precomputed plans.
    pub fn from_sizes(sizes: &[(u32, u32, u32)]) -> Result<Self> {
        let cases = sizes
            .iter()
            .map(|&(nx, ny, nz)| {
                Ok(BenchmarkCase {
                    size: LatticeSize::new(nx, ny, nz)?,
                    plan: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(cases)
    }

    /// The two small systems used for quick runs.
    pub fn debug() -> Self {
        Self {
            cases: vec![
                BenchmarkCase {
                    size: LatticeSize { nx: 4, ny: 4, nz: 8 },
                    plan: None,
                },
                BenchmarkCase {
                    size: LatticeSize { nx: 4, ny: 8, nz: 8 },
                    plan: None,
                },
            ],
        }
    }

    /// Load a sizes file.
    ///
    /// One case per line: `nx,ny,nz`, optionally followed by
    /// `block_size,threads,skin,algorithm,gridsync,newton3`. Blank lines and
    /// lines starting with `#` are ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(text.as_bytes());

        let mut cases = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let line = record.position().map_or(index as u64 + 1, |p| p.line());
            cases.push(parse_case(&record).map_err(|e| {
                DriverError::Config(format!("line {line}: {e}"))
            })?);
        }
        Self::new(cases)
    }

    pub fn cases(&self) -> &[BenchmarkCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

fn parse_case(record: &csv::StringRecord) -> Result<BenchmarkCase> {
    let field = |i: usize| record.get(i).unwrap_or_default();
    let int = |i: usize| -> Result<u32> {
        field(i)
            .parse()
            .map_err(|_| DriverError::Config(format!("field {} is not an integer: {:?}", i + 1, field(i))))
    };
    let flag = |i: usize| -> Result<bool> {
        match field(i).to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(DriverError::Config(format!(
                "field {} is not a boolean: {other:?}",
                i + 1
            ))),
        }
    };

    let size = match record.len() {
        3 | 9 => LatticeSize::new(int(0)?, int(1)?, int(2)?)?,
        n => {
            return Err(DriverError::Config(format!(
                "expected 3 or 9 fields, found {n}"
            )))
        }
    };

    let plan = if record.len() == 9 {
        let skin: f64 = field(5)
            .parse()
            .map_err(|_| DriverError::Config(format!("skin is not a number: {:?}", field(5))))?;
        Some(ComputePlan::new(
            int(3)?,
            int(4)?,
            skin,
            field(6).parse()?,
            flag(7)?,
            flag(8)?,
        )?)
    } else {
        None
    };

    Ok(BenchmarkCase { size, plan })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fcc_atom_count() {
        let size = LatticeSize::new(4, 4, 8).unwrap();
        assert_eq!(size.cells(), 128);
        assert_eq!(size.fcc_atoms(), 512);
        assert_eq!(size.to_string(), "4x4x8");
    }

    #[test]
    fn zero_dimension_rejected() {
        assert!(LatticeSize::new(0, 4, 4).is_err());
        assert!(BenchmarkConfiguration::from_sizes(&[(4, 4, 0)]).is_err());
    }

    #[test]
    fn empty_configuration_rejected() {
        assert!(BenchmarkConfiguration::new(Vec::new()).is_err());
        assert!(BenchmarkConfiguration::parse("# nothing here\n\n").is_err());
    }

    #[test]
    fn plan_validation() {
        let ok = ComputePlan::new(64, 4, 0.5, NeighborListAlgorithm::NSquared, true, false);
        assert!(ok.is_ok());
        assert!(ComputePlan::new(48, 4, 0.5, NeighborListAlgorithm::NSquared, true, false).is_err());
        assert!(ComputePlan::new(64, 0, 0.5, NeighborListAlgorithm::NSquared, true, false).is_err());
        assert!(ComputePlan::new(64, 4, -0.1, NeighborListAlgorithm::LinkedLists, true, false).is_err());
        assert!(ComputePlan::new(64, 4, f64::NAN, NeighborListAlgorithm::LinkedLists, true, false).is_err());
    }

    #[test]
    fn plan_uses_engine_key_names() {
        let plan = ComputePlan::new(32, 8, 0.3, NeighborListAlgorithm::LinkedLists, false, true).unwrap();
        let json = serde_json::to_value(plan).unwrap();
        assert_eq!(json["pb"], 32);
        assert_eq!(json["tp"], 8);
        assert_eq!(json["nblist"], "linked lists");
        assert_eq!(json["UtilizeNIII"], true);

        let back: ComputePlan = serde_json::from_value(json).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn invalid_plan_rejected_on_deserialize() {
        let json = serde_json::json!({
            "pb": 33, "tp": 4, "skin": 0.5, "nblist": "N squared",
            "gridsync": true, "UtilizeNIII": false
        });
        assert!(serde_json::from_value::<ComputePlan>(json).is_err());
    }

    #[test]
    fn parse_sizes_file() {
        let text = "\
# nx, ny, nz [, pb, tp, skin, nblist, gridsync, newton3]
8, 8, 8

8, 8, 16, 64, 4, 0.5, linked_lists, true, 0
";
        let config = BenchmarkConfiguration::parse(text).unwrap();
        assert_eq!(config.len(), 2);

        let first = config.cases()[0];
        assert_eq!(first.size, LatticeSize::new(8, 8, 8).unwrap());
        assert!(first.plan.is_none());

        let plan = config.cases()[1].plan.unwrap();
        assert_eq!(plan.block_size(), 64);
        assert_eq!(plan.algorithm(), NeighborListAlgorithm::LinkedLists);
        assert!(plan.gridsync());
        assert!(!plan.newton3());
    }

    #[test]
    fn parse_reports_bad_line() {
        let err = BenchmarkConfiguration::parse("8,8,8\n8,8\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");

        let err = BenchmarkConfiguration::parse("8,8,x\n").unwrap_err();
        assert!(err.to_string().contains("not an integer"), "{err}");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nxyzs.txt");
        std::fs::write(&path, "4,4,8\n4,8,8\n").unwrap();
        assert_eq!(
            BenchmarkConfiguration::load(&path).unwrap(),
            BenchmarkConfiguration::debug()
        );
        assert!(BenchmarkConfiguration::load(dir.path().join("missing.txt")).is_err());
    }
}

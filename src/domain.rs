//! Problem definition: materials, sources, and their voxel indexing.
//!
//! Named voxel domains are resolved into index vectors, validated,
//! and split into the electric and magnetic classes. Material and
//! source parameters are tagged sums resolved once per sweep into
//! homogeneous per-voxel arrays; no string dispatch survives past
//! this module.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::constants::MU_0;
use crate::error::{Error, Result};
use crate::voxel::Geometry;
use crate::C64;

/// Material class of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialType {
    Electric,
    Magnetic,
    Electromagnetic,
}

/// Material domain definition (geometry-level, value-free).
#[derive(Debug, Clone)]
pub struct MaterialDef {
    pub material_type: MaterialType,
    pub domain_list: Vec<String>,
}

/// Per-axis complex material parameter of a domain.
///
/// Lumped values are broadcast to every voxel of the domain,
/// distributed values are given per voxel (in the concatenated
/// domain-list order). Anisotropic values are per axis.
#[derive(Debug, Clone)]
pub enum MaterialParam {
    LumpedIso(C64),
    LumpedAniso([C64; 3]),
    DistributedIso(Vec<C64>),
    DistributedAniso(Vec<[C64; 3]>),
}

impl MaterialParam {
    /// Resolve into one `[x, y, z]` value per voxel.
    fn resolve(&self, tag: &str, n: usize) -> Result<Vec<[C64; 3]>> {
        match self {
            MaterialParam::LumpedIso(v) => Ok(vec![[*v, *v, *v]; n]),
            MaterialParam::LumpedAniso(v) => Ok(vec![*v; n]),
            MaterialParam::DistributedIso(vals) => {
                if vals.len() != n {
                    return Err(Error::LengthMismatch(tag.to_string()));
                }
                Ok(vals.iter().map(|&v| [v, v, v]).collect())
            }
            MaterialParam::DistributedAniso(vals) => {
                if vals.len() != n {
                    return Err(Error::LengthMismatch(tag.to_string()));
                }
                Ok(vals.clone())
            }
        }
    }
}

/// Material values for one sweep.
///
/// The magnetic susceptibility is the complex value `chi_re - j*chi_im`
/// (a positive loss part enters with a negative imaginary sign).
#[derive(Debug, Clone)]
pub enum MaterialValue {
    Electric { rho: MaterialParam },
    Magnetic { chi: MaterialParam },
    Electromagnetic { rho: MaterialParam, chi: MaterialParam },
}

/// Source class of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Current,
    Voltage,
}

/// Source domain definition (geometry-level, value-free).
#[derive(Debug, Clone)]
pub struct SourceDef {
    pub source_type: SourceType,
    pub domain_list: Vec<String>,
}

/// Scalar (lumped) or per-voxel (distributed) source parameter.
#[derive(Debug, Clone)]
pub enum SourceParam {
    Lumped(C64),
    Distributed(Vec<C64>),
}

/// Source values for one sweep.
#[derive(Debug, Clone)]
pub enum SourceValue {
    /// Current source with its internal admittance.
    Current { current: SourceParam, admittance: SourceParam },
    /// Voltage source with its internal impedance.
    Voltage { voltage: SourceParam, impedance: SourceParam },
}

/// Local positions of one material domain.
#[derive(Debug, Clone)]
pub struct MaterialPos {
    pub material_type: MaterialType,
    /// Global voxel indices (concatenated domain-list order).
    pub idx: Vec<usize>,
    /// Rows into `idx_vc` (electric/electromagnetic materials).
    pub pos_vc: Vec<usize>,
    /// Rows into `idx_vm` (magnetic/electromagnetic materials).
    pub pos_vm: Vec<usize>,
}

/// Local positions of one source domain.
#[derive(Debug, Clone)]
pub struct SourcePos {
    pub source_type: SourceType,
    /// Global voxel indices (concatenated domain-list order).
    pub idx: Vec<usize>,
    /// Rows into `idx_vc`.
    pub pos_vc: Vec<usize>,
    /// Rows into the concatenated source block of the solution.
    pub pos_src: Vec<usize>,
}

/// Index sets of the problem, built once per geometry.
#[derive(Debug, Clone)]
pub struct ProblemIndexing {
    /// Non-empty electric voxels (sorted unique).
    pub idx_vc: Vec<usize>,
    /// Non-empty magnetic voxels (sorted unique).
    pub idx_vm: Vec<usize>,
    /// Voxels of the current sources (source-block order).
    pub idx_src_c: Vec<usize>,
    /// Voxels of the voltage sources (source-block order).
    pub idx_src_v: Vec<usize>,
    pub material_pos: BTreeMap<String, MaterialPos>,
    pub source_pos: BTreeMap<String, SourcePos>,
}

impl ProblemIndexing {
    pub fn has_electric(&self) -> bool {
        !self.idx_vc.is_empty()
    }

    pub fn has_magnetic(&self) -> bool {
        !self.idx_vm.is_empty()
    }

    /// Coupling is required when both domains are present.
    pub fn has_coupling(&self) -> bool {
        self.has_electric() && self.has_magnetic()
    }

    pub fn n_src(&self) -> usize {
        self.idx_src_c.len() + self.idx_src_v.len()
    }
}

/// Resolve a list of domain names into the concatenated index vector.
fn domain_indices(
    geometry: &Geometry,
    domain_list: &[String],
) -> Result<Vec<usize>> {
    let nv = geometry.grid.voxel_count();
    let mut idx_all = Vec::new();
    for tag in domain_list {
        let idx = geometry
            .domain_def
            .get(tag)
            .ok_or_else(|| Error::UnknownDomain(tag.clone()))?;
        for w in idx.windows(2) {
            if w[1] <= w[0] {
                return Err(Error::DuplicateIndices(tag.clone()));
            }
        }
        if idx.iter().any(|&i| i >= nv) {
            return Err(Error::IndexOutOfRange(tag.clone()));
        }
        idx_all.extend_from_slice(idx);
    }
    Ok(idx_all)
}

/// Accumulate domain indices into a class set, rejecting duplicates.
fn accumulate(set: &mut HashSet<usize>, idx: &[usize], tag: &str) -> Result<()> {
    for &i in idx {
        if !set.insert(i) {
            return Err(Error::DuplicateIndices(tag.to_string()));
        }
    }
    Ok(())
}

/// Build and validate the index sets of the problem.
pub fn build_indexing(
    geometry: &Geometry,
    material_def: &BTreeMap<String, MaterialDef>,
    source_def: &BTreeMap<String, SourceDef>,
) -> Result<ProblemIndexing> {
    // resolve the material domains and split the classes
    let mut set_c = HashSet::new();
    let mut set_m = HashSet::new();
    let mut set_c_pure = HashSet::new();
    let mut set_m_pure = HashSet::new();
    let mut material_idx = BTreeMap::new();

    for (tag, def) in material_def {
        let idx = domain_indices(geometry, &def.domain_list)?;
        match def.material_type {
            MaterialType::Electric => {
                accumulate(&mut set_c, &idx, tag)?;
                set_c_pure.extend(idx.iter().copied());
            }
            MaterialType::Magnetic => {
                accumulate(&mut set_m, &idx, tag)?;
                set_m_pure.extend(idx.iter().copied());
            }
            MaterialType::Electromagnetic => {
                accumulate(&mut set_c, &idx, tag)?;
                accumulate(&mut set_m, &idx, tag)?;
            }
        }
        material_idx.insert(tag.clone(), (def.material_type, idx));
    }

    // electric/magnetic overlap is only allowed inside an
    // electromagnetic material
    if set_c_pure.intersection(&set_m_pure).next().is_some() {
        return Err(Error::MaterialOverlap);
    }

    let mut idx_vc: Vec<usize> = set_c.into_iter().collect();
    let mut idx_vm: Vec<usize> = set_m.into_iter().collect();
    idx_vc.sort_unstable();
    idx_vm.sort_unstable();

    if idx_vc.is_empty() {
        return Err(Error::NoElectricVoxel);
    }

    // resolve the source domains
    let mut idx_src_c = Vec::new();
    let mut idx_src_v = Vec::new();
    let mut source_idx = BTreeMap::new();
    let mut set_src = HashSet::new();

    for (tag, def) in source_def {
        let idx = domain_indices(geometry, &def.domain_list)?;
        accumulate(&mut set_src, &idx, tag)?;
        match def.source_type {
            SourceType::Current => idx_src_c.extend_from_slice(&idx),
            SourceType::Voltage => idx_src_v.extend_from_slice(&idx),
        }
        source_idx.insert(tag.clone(), (def.source_type, idx));
    }

    if idx_src_c.is_empty() && idx_src_v.is_empty() {
        return Err(Error::NoSource);
    }

    // source voxels must be electric voxels
    let local_vc: HashMap<usize, usize> =
        idx_vc.iter().enumerate().map(|(row, &g)| (g, row)).collect();
    if idx_src_c.iter().chain(idx_src_v.iter()).any(|g| !local_vc.contains_key(g)) {
        return Err(Error::SourceOutsideElectric);
    }

    // every connected component with electric voxels needs a source
    for component in &geometry.graph_def {
        let has_electric = component.iter().any(|g| local_vc.contains_key(g));
        let has_source = component.iter().any(|g| set_src.contains(g));
        if has_electric && !has_source {
            return Err(Error::ComponentWithoutSource);
        }
    }

    let local_vm: HashMap<usize, usize> =
        idx_vm.iter().enumerate().map(|(row, &g)| (g, row)).collect();

    // local positions of the materials
    let mut material_pos = BTreeMap::new();
    for (tag, (material_type, idx)) in material_idx {
        let pos_vc = match material_type {
            MaterialType::Electric | MaterialType::Electromagnetic => {
                idx.iter().map(|g| local_vc[g]).collect()
            }
            MaterialType::Magnetic => Vec::new(),
        };
        let pos_vm = match material_type {
            MaterialType::Magnetic | MaterialType::Electromagnetic => {
                idx.iter().map(|g| local_vm[g]).collect()
            }
            MaterialType::Electric => Vec::new(),
        };
        material_pos.insert(
            tag,
            MaterialPos {
                material_type,
                idx,
                pos_vc,
                pos_vm,
            },
        );
    }

    // local positions of the sources: the source block of the
    // solution concatenates the current sources then the voltage ones
    let src_block: HashMap<usize, usize> = idx_src_c
        .iter()
        .chain(idx_src_v.iter())
        .enumerate()
        .map(|(row, &g)| (g, row))
        .collect();

    let mut source_pos = BTreeMap::new();
    for (tag, (source_type, idx)) in source_idx {
        let pos_vc = idx.iter().map(|g| local_vc[g]).collect();
        let pos_src = idx.iter().map(|g| src_block[g]).collect();
        source_pos.insert(
            tag,
            SourcePos {
                source_type,
                idx,
                pos_vc,
                pos_src,
            },
        );
    }

    Ok(ProblemIndexing {
        idx_vc,
        idx_vm,
        idx_src_c,
        idx_src_v,
        material_pos,
        source_pos,
    })
}

/// Per-voxel resistivities of one sweep, aligned with the index sets.
#[derive(Debug, Clone)]
pub struct MaterialVectors {
    /// Electric resistivity per electric voxel and axis.
    pub rho_vc: Vec<[C64; 3]>,
    /// Equivalent magnetic resistivity `1/(mu_0*chi)` per magnetic
    /// voxel and axis.
    pub rho_vm: Vec<[C64; 3]>,
}

/// Resolve the material values into per-voxel arrays.
pub fn material_vectors(
    indexing: &ProblemIndexing,
    material_val: &BTreeMap<String, MaterialValue>,
) -> Result<MaterialVectors> {
    let zero = [C64::new(0., 0.); 3];
    let mut rho_vc = vec![zero; indexing.idx_vc.len()];
    let mut rho_vm = vec![zero; indexing.idx_vm.len()];

    for (tag, pos) in &indexing.material_pos {
        let val = material_val
            .get(tag)
            .ok_or_else(|| Error::MissingMaterial(tag.clone()))?;
        let n = pos.idx.len();

        let (rho, chi) = match (pos.material_type, val) {
            (MaterialType::Electric, MaterialValue::Electric { rho }) => {
                (Some(rho.resolve(tag, n)?), None)
            }
            (MaterialType::Magnetic, MaterialValue::Magnetic { chi }) => {
                (None, Some(chi.resolve(tag, n)?))
            }
            (MaterialType::Electromagnetic, MaterialValue::Electromagnetic { rho, chi }) => {
                (Some(rho.resolve(tag, n)?), Some(chi.resolve(tag, n)?))
            }
            _ => return Err(Error::InvalidValue(format!("material type mismatch: {tag}"))),
        };

        if let Some(rho) = rho {
            for (i, &row) in pos.pos_vc.iter().enumerate() {
                rho_vc[row] = rho[i];
            }
        }
        if let Some(chi) = chi {
            for (i, &row) in pos.pos_vm.iter().enumerate() {
                let mut val = [C64::new(0., 0.); 3];
                for a in 0..3 {
                    val[a] = 1. / (MU_0 * chi[i][a]);
                }
                rho_vm[row] = val;
            }
        }
    }

    Ok(MaterialVectors { rho_vc, rho_vm })
}

/// Source excitations and internal elements of one sweep, aligned
/// with the source block (current sources first, then voltage ones).
#[derive(Debug, Clone)]
pub struct SourceVectors {
    /// Current excitation per current-source voxel.
    pub value_src_c: Vec<C64>,
    /// Internal admittance per current-source voxel.
    pub element_src_c: Vec<C64>,
    /// Voltage excitation per voltage-source voxel.
    pub value_src_v: Vec<C64>,
    /// Internal impedance per voltage-source voxel.
    pub element_src_v: Vec<C64>,
}

impl SourceParam {
    fn resolve(&self, tag: &str, n: usize) -> Result<Vec<C64>> {
        match self {
            SourceParam::Lumped(v) => Ok(vec![*v; n]),
            SourceParam::Distributed(vals) => {
                if vals.len() != n {
                    return Err(Error::LengthMismatch(tag.to_string()));
                }
                Ok(vals.clone())
            }
        }
    }

    fn is_lumped(&self) -> bool {
        matches!(self, SourceParam::Lumped(_))
    }
}

/// Resolve the source values into the source-block vectors.
///
/// Lumped parameters describe the whole terminal: the current and the
/// admittance are split across the domain voxels, the impedance is
/// multiplied by the voxel count (parallel connection).
pub fn source_vectors(
    indexing: &ProblemIndexing,
    source_val: &BTreeMap<String, SourceValue>,
) -> Result<SourceVectors> {
    let n_c = indexing.idx_src_c.len();
    let n_v = indexing.idx_src_v.len();
    let zero = C64::new(0., 0.);
    let mut out = SourceVectors {
        value_src_c: vec![zero; n_c],
        element_src_c: vec![zero; n_c],
        value_src_v: vec![zero; n_v],
        element_src_v: vec![zero; n_v],
    };

    for (tag, pos) in &indexing.source_pos {
        let val = source_val
            .get(tag)
            .ok_or_else(|| Error::MissingSource(tag.clone()))?;
        let n = pos.idx.len();
        let share = n as f64;

        match (pos.source_type, val) {
            (SourceType::Current, SourceValue::Current { current, admittance }) => {
                let mut value = current.resolve(tag, n)?;
                let mut element = admittance.resolve(tag, n)?;
                if current.is_lumped() {
                    value.iter_mut().for_each(|v| *v /= share);
                }
                if admittance.is_lumped() {
                    element.iter_mut().for_each(|v| *v /= share);
                }
                for (i, &row) in pos.pos_src.iter().enumerate() {
                    out.value_src_c[row] = value[i];
                    out.element_src_c[row] = element[i];
                }
            }
            (SourceType::Voltage, SourceValue::Voltage { voltage, impedance }) => {
                let value = voltage.resolve(tag, n)?;
                let mut element = impedance.resolve(tag, n)?;
                if impedance.is_lumped() {
                    element.iter_mut().for_each(|v| *v *= share);
                }
                for (i, &row) in pos.pos_src.iter().enumerate() {
                    out.value_src_v[row - n_c] = value[i];
                    out.element_src_v[row - n_c] = element[i];
                }
            }
            _ => return Err(Error::InvalidValue(format!("source type mismatch: {tag}"))),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voxel::VoxelGrid;

    fn geometry() -> Geometry {
        let mut domain_def = BTreeMap::new();
        domain_def.insert("cond".to_string(), vec![0, 1, 2]);
        domain_def.insert("mag".to_string(), vec![3, 4]);
        domain_def.insert("src".to_string(), vec![0]);
        Geometry {
            grid: VoxelGrid {
                n: [5, 1, 1],
                d: [1e-3, 1e-3, 1e-3],
                c: [0., 0., 0.],
            },
            domain_def,
            graph_def: vec![vec![0, 1, 2], vec![3, 4]],
            pts_cloud: Vec::new(),
        }
    }

    fn material_def() -> BTreeMap<String, MaterialDef> {
        let mut def = BTreeMap::new();
        def.insert(
            "cond".to_string(),
            MaterialDef {
                material_type: MaterialType::Electric,
                domain_list: vec!["cond".to_string()],
            },
        );
        def.insert(
            "mag".to_string(),
            MaterialDef {
                material_type: MaterialType::Magnetic,
                domain_list: vec!["mag".to_string()],
            },
        );
        def
    }

    fn source_def() -> BTreeMap<String, SourceDef> {
        let mut def = BTreeMap::new();
        def.insert(
            "src".to_string(),
            SourceDef {
                source_type: SourceType::Current,
                domain_list: vec!["src".to_string()],
            },
        );
        def
    }

    #[test]
    fn indexing_splits_classes() {
        let idx = build_indexing(&geometry(), &material_def(), &source_def()).unwrap();
        assert_eq!(idx.idx_vc, vec![0, 1, 2]);
        assert_eq!(idx.idx_vm, vec![3, 4]);
        assert_eq!(idx.idx_src_c, vec![0]);
        assert!(idx.idx_src_v.is_empty());
        assert!(idx.has_coupling());
    }

    #[test]
    fn source_outside_electric_rejected() {
        let mut geo = geometry();
        geo.domain_def.insert("src".to_string(), vec![4]);
        let err = build_indexing(&geo, &material_def(), &source_def()).unwrap_err();
        assert_eq!(err, Error::SourceOutsideElectric);
    }

    #[test]
    fn component_without_source_rejected() {
        let mut geo = geometry();
        // make the magnetic part electric so the second component has
        // electric voxels but no source
        let mut mats = material_def();
        mats.get_mut("mag").unwrap().material_type = MaterialType::Electric;
        let err = build_indexing(&geo, &mats, &source_def()).unwrap_err();
        assert_eq!(err, Error::ComponentWithoutSource);
        geo.graph_def = vec![vec![0, 1, 2, 3, 4]];
        assert!(build_indexing(&geo, &mats, &source_def()).is_ok());
    }

    #[test]
    fn overlap_rejected_outside_electromagnetic() {
        let mut geo = geometry();
        geo.domain_def.insert("mag".to_string(), vec![2, 3]);
        let err = build_indexing(&geo, &material_def(), &source_def()).unwrap_err();
        assert_eq!(err, Error::MaterialOverlap);
    }

    #[test]
    fn lumped_sources_are_split() {
        let mut geo = geometry();
        geo.domain_def.insert("src".to_string(), vec![0, 1]);
        let idx = build_indexing(&geo, &material_def(), &source_def()).unwrap();

        let mut vals = BTreeMap::new();
        vals.insert(
            "src".to_string(),
            SourceValue::Current {
                current: SourceParam::Lumped(C64::new(2., 0.)),
                admittance: SourceParam::Lumped(C64::new(4., 0.)),
            },
        );
        let src = source_vectors(&idx, &vals).unwrap();
        assert_eq!(src.value_src_c, vec![C64::new(1., 0.); 2]);
        assert_eq!(src.element_src_c, vec![C64::new(2., 0.); 2]);
    }

    #[test]
    fn magnetic_resistivity_from_susceptibility() {
        let idx = build_indexing(&geometry(), &material_def(), &source_def()).unwrap();
        let mut vals = BTreeMap::new();
        vals.insert(
            "cond".to_string(),
            MaterialValue::Electric {
                rho: MaterialParam::LumpedIso(C64::new(1e-8, 0.)),
            },
        );
        vals.insert(
            "mag".to_string(),
            MaterialValue::Magnetic {
                chi: MaterialParam::LumpedIso(C64::new(1e3, 0.)),
            },
        );
        let mat = material_vectors(&idx, &vals).unwrap();
        assert_eq!(mat.rho_vc.len(), 3);
        assert_eq!(mat.rho_vm.len(), 2);
        let expected = 1. / (MU_0 * 1e3);
        assert!((mat.rho_vm[0][0].re - expected).abs() < 1e-12 * expected.abs());
        assert!((mat.rho_vc[1][2] - C64::new(1e-8, 0.)).norm() < 1e-20);
    }
}

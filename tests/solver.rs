//! End-to-end tests of the solver pipeline on small voxel circuits.

use std::collections::BTreeMap;

use approx::assert_relative_eq;
use num_complex::Complex;

use voxpeec::domain::{
    MaterialDef, MaterialParam, MaterialType, MaterialValue, SourceDef, SourceParam, SourceType,
    SourceValue,
};
use voxpeec::options::Coupling;
use voxpeec::{run_sweeps, Geometry, SweepDef, SweepParam, Tolerance, VoxelGrid};

type C64 = Complex<f64>;

const RHO: f64 = 1e-8;
const D: [f64; 3] = [1e-3, 1e-3, 1e-3];

fn zero() -> C64 {
    C64::new(0., 0.)
}

/// Conductor chain of `n` voxels along x with a source domain at each
/// end (voxel 0 and voxel n-1).
fn chain_geometry(n: usize) -> Geometry {
    let mut domain_def = BTreeMap::new();
    domain_def.insert("cond".to_string(), (1..n - 1).collect::<Vec<_>>());
    domain_def.insert("src".to_string(), vec![0]);
    domain_def.insert("sink".to_string(), vec![n - 1]);
    Geometry {
        grid: VoxelGrid {
            n: [n, 1, 1],
            d: D,
            c: [0., 0., 0.],
        },
        domain_def,
        graph_def: vec![(0..n).collect()],
        pts_cloud: Vec::new(),
    }
}

fn chain_materials() -> BTreeMap<String, MaterialDef> {
    let mut def = BTreeMap::new();
    def.insert(
        "cond".to_string(),
        MaterialDef {
            material_type: MaterialType::Electric,
            domain_list: vec!["cond".to_string(), "src".to_string(), "sink".to_string()],
        },
    );
    def
}

fn chain_material_values() -> BTreeMap<String, MaterialValue> {
    let mut val = BTreeMap::new();
    val.insert(
        "cond".to_string(),
        MaterialValue::Electric {
            rho: MaterialParam::LumpedIso(C64::new(RHO, 0.)),
        },
    );
    val
}

fn current_drive(current: C64) -> (BTreeMap<String, SourceDef>, BTreeMap<String, SourceValue>) {
    let mut def = BTreeMap::new();
    def.insert(
        "src".to_string(),
        SourceDef {
            source_type: SourceType::Current,
            domain_list: vec!["src".to_string()],
        },
    );
    def.insert(
        "sink".to_string(),
        SourceDef {
            source_type: SourceType::Voltage,
            domain_list: vec!["sink".to_string()],
        },
    );
    let mut val = BTreeMap::new();
    val.insert(
        "src".to_string(),
        SourceValue::Current {
            current: SourceParam::Lumped(current),
            admittance: SourceParam::Lumped(zero()),
        },
    );
    val.insert(
        "sink".to_string(),
        SourceValue::Voltage {
            voltage: SourceParam::Lumped(zero()),
            impedance: SourceParam::Lumped(zero()),
        },
    );
    (def, val)
}

fn voltage_drive(voltage: C64) -> (BTreeMap<String, SourceDef>, BTreeMap<String, SourceValue>) {
    let mut def = BTreeMap::new();
    for tag in ["src", "sink"] {
        def.insert(
            tag.to_string(),
            SourceDef {
                source_type: SourceType::Voltage,
                domain_list: vec![tag.to_string()],
            },
        );
    }
    let mut val = BTreeMap::new();
    val.insert(
        "src".to_string(),
        SourceValue::Voltage {
            voltage: SourceParam::Lumped(voltage),
            impedance: SourceParam::Lumped(zero()),
        },
    );
    val.insert(
        "sink".to_string(),
        SourceValue::Voltage {
            voltage: SourceParam::Lumped(zero()),
            impedance: SourceParam::Lumped(zero()),
        },
    );
    (def, val)
}

/// Default options with Krylov tolerances tightened well below the
/// residuum status check.
fn test_tolerance() -> Tolerance {
    // capture the solver logs in the test output
    let _ = env_logger::builder().is_test(true).try_init();

    let mut tol = Tolerance::default();
    tol.solver_options.direct_options.rel_tol = 1e-9;
    tol.solver_options.segregated_options.iter_electric_options.rel_tol = 1e-9;
    tol.solver_options.segregated_options.iter_magnetic_options.rel_tol = 1e-9;
    tol
}

fn single_sweep(
    freq: f64,
    material_val: BTreeMap<String, MaterialValue>,
    source_val: BTreeMap<String, SourceValue>,
) -> BTreeMap<String, SweepDef> {
    let mut sweeps = BTreeMap::new();
    sweeps.insert(
        "run".to_string(),
        SweepDef {
            init: None,
            param: SweepParam {
                freq,
                material_val,
                source_val,
            },
        },
    );
    sweeps
}

#[test]
fn dc_current_source_ohms_law() {
    // two voxels, one internal face: V = I*R with R = rho*dx/(dy*dz)
    let (src_def, src_val) = current_drive(C64::new(1., 0.));
    let out = run_sweeps(
        chain_geometry(2),
        &chain_materials(),
        &src_def,
        &single_sweep(0., chain_material_values(), src_val),
        test_tolerance(),
    )
    .unwrap();

    let res = &out["run"];
    assert!(res.solution_ok);

    let r_face = RHO * D[0] / (D[1] * D[2]);
    let term = &res.source_values["src"];
    assert_relative_eq!(term.v.re, r_face, max_relative = 1e-8);
    assert_relative_eq!(term.i.re, 1., max_relative = 1e-8);
    assert_relative_eq!(term.s.re, r_face, max_relative = 1e-8);

    // dissipated power equals the terminal power
    assert_relative_eq!(res.integral_total.p_electric, r_face, max_relative = 1e-8);

    // the full-grid extension scatters the potentials at the voxel
    // indices (both voxels are electric here)
    let v_grid = res
        .field_values
        .extend_electric(&res.field_values.v_vc, zero());
    assert_eq!(v_grid.len(), 2);
    assert_relative_eq!(v_grid[0].re, r_face, max_relative = 1e-8);
    assert!(v_grid[1].norm() < 1e-12 * r_face);
}

#[test]
fn dc_voltage_drive_slab_resistance() {
    // 4 voxels in series: 3 internal faces between the terminals
    let (src_def, src_val) = voltage_drive(C64::new(1., 0.));
    let out = run_sweeps(
        chain_geometry(4),
        &chain_materials(),
        &src_def,
        &single_sweep(0., chain_material_values(), src_val),
        test_tolerance(),
    )
    .unwrap();

    let res = &out["run"];
    assert!(res.solution_ok);

    let r_total = 3. * RHO * D[0] / (D[1] * D[2]);
    let term = &res.source_values["src"];
    assert_relative_eq!(term.i.re, 1. / r_total, max_relative = 1e-6);
    assert_relative_eq!(term.s.re, 1. / r_total, max_relative = 1e-6);

    // power balance over all the terminals
    let s_total: f64 = res.source_values.values().map(|t| t.s.re).sum();
    assert_relative_eq!(s_total, res.integral_total.p_total, max_relative = 1e-6);
}

#[test]
fn dc_solution_is_real() {
    let (src_def, src_val) = current_drive(C64::new(1., 0.));
    let out = run_sweeps(
        chain_geometry(4),
        &chain_materials(),
        &src_def,
        &single_sweep(0., chain_material_values(), src_val),
        test_tolerance(),
    )
    .unwrap();

    let res = &out["run"];
    assert!(res.solution_ok);
    for i in 0..res.sol.nrows() {
        assert!(res.sol[i].re.is_finite());
        assert!(res.sol[i].im.abs() < 1e-10 * res.sol[i].re.abs().max(1.));
    }
}

#[test]
fn ac_power_balance() {
    let (src_def, src_val) = voltage_drive(C64::new(1., 0.));
    let out = run_sweeps(
        chain_geometry(4),
        &chain_materials(),
        &src_def,
        &single_sweep(1e3, chain_material_values(), src_val),
        test_tolerance(),
    )
    .unwrap();

    let res = &out["run"];
    assert!(res.solution_ok);

    // active terminal power matches the dissipated power
    let s_total: f64 = res.source_values.values().map(|t| t.s.re).sum();
    assert_relative_eq!(s_total, res.integral_total.p_total, max_relative = 1e-4);
    assert!(res.integral_total.w_electric > 0.);
}

#[test]
fn zero_excitation_zero_solution() {
    let (src_def, src_val) = current_drive(zero());
    let out = run_sweeps(
        chain_geometry(4),
        &chain_materials(),
        &src_def,
        &single_sweep(1e3, chain_material_values(), src_val),
        test_tolerance(),
    )
    .unwrap();

    let res = &out["run"];
    assert!(res.solution_ok);
    assert!(res.sol.norm_l2() < 1e-12);
    assert_eq!(res.solver_status.n_iter, 0);
    for term in res.source_values.values() {
        assert!(term.v.norm() < 1e-12);
        assert!(term.i.norm() < 1e-12);
    }
}

#[test]
fn empty_magnetic_domain_is_well_formed() {
    let (src_def, src_val) = current_drive(C64::new(1., 0.));
    let out = run_sweeps(
        chain_geometry(3),
        &chain_materials(),
        &src_def,
        &single_sweep(1e3, chain_material_values(), src_val),
        test_tolerance(),
    )
    .unwrap();

    let res = &out["run"];
    assert!(res.solution_ok);
    assert_eq!(res.solver_status.n_dof_magnetic, 0);
    assert!(res.field_values.v_vm.is_empty());
    assert!(res.field_values.b_vm.is_empty());
    for i in 0..res.sol.nrows() {
        assert!(res.sol[i].re.is_finite() && res.sol[i].im.is_finite());
    }

    // the magnetic extension of an empty domain is all zeros
    let v_grid = res
        .field_values
        .extend_magnetic(&res.field_values.v_vm, zero());
    assert_eq!(v_grid.len(), 3);
    assert!(v_grid.iter().all(|v| *v == zero()));
}

#[test]
fn warm_start_reuses_parent_solution() {
    let (src_def, src_val) = voltage_drive(C64::new(1., 0.));
    let param = SweepParam {
        freq: 1e3,
        material_val: chain_material_values(),
        source_val: src_val,
    };

    let mut sweeps = BTreeMap::new();
    sweeps.insert(
        "a".to_string(),
        SweepDef {
            init: None,
            param: param.clone(),
        },
    );
    sweeps.insert(
        "b".to_string(),
        SweepDef {
            init: Some("a".to_string()),
            param,
        },
    );

    let out = run_sweeps(
        chain_geometry(4),
        &chain_materials(),
        &src_def,
        &sweeps,
        test_tolerance(),
    )
    .unwrap();

    assert!(out["a"].solution_ok);
    assert!(out["b"].solution_ok);
    // identical problem: the warm start is already converged
    assert!(out["b"].solver_status.n_iter <= 1);
    assert!(out["b"].solver_status.n_iter < out["a"].solver_status.n_iter);
}

/// Electric wire next to a magnetic block.
fn coupled_geometry() -> Geometry {
    // 4x3x1 grid: the wire runs along x at y=0, the magnetic block
    // sits at y=2
    let grid = VoxelGrid {
        n: [4, 3, 1],
        d: D,
        c: [0., 0., 0.],
    };
    let wire: Vec<usize> = (0..4).collect();
    let plate: Vec<usize> = vec![8, 9, 10, 11];

    let mut domain_def = BTreeMap::new();
    domain_def.insert("wire".to_string(), wire[1..3].to_vec());
    domain_def.insert("src".to_string(), vec![wire[0]]);
    domain_def.insert("sink".to_string(), vec![wire[3]]);
    domain_def.insert("plate".to_string(), plate);
    Geometry {
        grid,
        domain_def,
        graph_def: Vec::new(),
        pts_cloud: vec![[0., 0., 0.05]],
    }
}

fn coupled_problem() -> (
    BTreeMap<String, MaterialDef>,
    BTreeMap<String, MaterialValue>,
    BTreeMap<String, SourceDef>,
    BTreeMap<String, SourceValue>,
) {
    let mut mat_def = chain_materials();
    mat_def.get_mut("cond").unwrap().domain_list =
        vec!["wire".to_string(), "src".to_string(), "sink".to_string()];
    mat_def.insert(
        "plate".to_string(),
        MaterialDef {
            material_type: MaterialType::Magnetic,
            domain_list: vec!["plate".to_string()],
        },
    );

    let mut mat_val = chain_material_values();
    mat_val.insert(
        "plate".to_string(),
        MaterialValue::Magnetic {
            chi: MaterialParam::LumpedIso(C64::new(1e3, 0.)),
        },
    );

    let (src_def, src_val) = current_drive(C64::new(1., 0.));
    (mat_def, mat_val, src_def, src_val)
}

#[test]
fn coupled_magnetic_block_responds() {
    let (mat_def, mat_val, src_def, src_val) = coupled_problem();
    let out = run_sweeps(
        coupled_geometry(),
        &mat_def,
        &src_def,
        &single_sweep(1e3, mat_val, src_val),
        test_tolerance(),
    )
    .unwrap();

    let res = &out["run"];
    assert!(res.solution_ok, "solver status: {:?}", res.solver_status);
    assert!(res.solver_status.n_dof_magnetic > 0);

    // the wire field magnetizes the block: nonzero flux densities
    let b_norm: f64 = res
        .field_values
        .b_vm
        .iter()
        .map(|b| b[0].norm() + b[1].norm() + b[2].norm())
        .sum();
    assert!(b_norm > 0.);

    // the cloud field is finite
    assert_eq!(res.field_values.h_cloud.len(), 1);
    for a in 0..3 {
        assert!(res.field_values.h_cloud[0][a].re.is_finite());
    }
}

#[test]
fn segregated_coupling_matches_direct() {
    let (mat_def, mat_val, src_def, src_val) = coupled_problem();

    let direct = run_sweeps(
        coupled_geometry(),
        &mat_def,
        &src_def,
        &single_sweep(1e3, mat_val.clone(), src_val.clone()),
        test_tolerance(),
    )
    .unwrap();

    let mut tolerance = test_tolerance();
    tolerance.solver_options.coupling = Coupling::Segregated;
    let segregated = run_sweeps(
        coupled_geometry(),
        &mat_def,
        &src_def,
        &single_sweep(1e3, mat_val, src_val),
        tolerance,
    )
    .unwrap();

    let i_direct = direct["run"].source_values["src"].i;
    let i_segregated = segregated["run"].source_values["src"].i;
    assert!(segregated["run"].solution_ok);
    assert_relative_eq!(i_direct.re, i_segregated.re, max_relative = 1e-3);
    assert_relative_eq!(i_direct.im, i_segregated.im, max_relative = 1e-3);
}

#[test]
fn parallel_sweeps_match_serial() {
    let (src_def, src_val) = voltage_drive(C64::new(1., 0.));
    let mut sweeps = BTreeMap::new();
    for (tag, freq) in [("f1", 1e2), ("f2", 1e3), ("f3", 1e4)] {
        sweeps.insert(
            tag.to_string(),
            SweepDef {
                init: None,
                param: SweepParam {
                    freq,
                    material_val: chain_material_values(),
                    source_val: src_val.clone(),
                },
            },
        );
    }

    let serial = run_sweeps(
        chain_geometry(4),
        &chain_materials(),
        &src_def,
        &sweeps,
        test_tolerance(),
    )
    .unwrap();

    let mut tolerance = test_tolerance();
    tolerance.parallel_sweep.n_jobs = 2;
    let parallel = run_sweeps(
        chain_geometry(4),
        &chain_materials(),
        &src_def,
        &sweeps,
        tolerance,
    )
    .unwrap();

    for tag in ["f1", "f2", "f3"] {
        let a = &serial[tag].source_values["src"].i;
        let b = &parallel[tag].source_values["src"].i;
        assert_relative_eq!(a.re, b.re, max_relative = 1e-10);
        assert_relative_eq!(a.im, b.im, max_relative = 1e-10);
    }
}

#[test]
fn invalid_problem_is_rejected() {
    // source outside the electric voxels
    let mut geo = chain_geometry(3);
    geo.domain_def.insert("src".to_string(), vec![7]);
    let (src_def, src_val) = current_drive(C64::new(1., 0.));
    let err = run_sweeps(
        geo,
        &chain_materials(),
        &src_def,
        &single_sweep(0., chain_material_values(), src_val),
        Tolerance::default(),
    );
    assert!(err.is_err());
}

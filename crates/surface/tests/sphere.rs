use std::f64::consts::PI;

use float_eq::assert_float_eq;
use kiln_mesh::describe;
use kiln_surface::{choose_threshold, extract, field_to_mesh, nifti, normalize, ScalarField};
use kiln_test_data::{sphere, sphere_radius, NiftiBuilder, Volume};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn field(volume: Volume) -> ScalarField {
    ScalarField::new(volume.dims, volume.spacing, volume.values).unwrap()
}

#[test]
fn sphere_is_watertight_with_expected_volume() {
    let threshold = 0.47;
    let field = field(sphere(41, 1.0));
    let mesh = extract(&field, threshold, field.spacing()).unwrap();
    let info = describe(&mesh);

    assert!(info.is_watertight);
    assert!(info.is_winding_consistent);
    let r = f64::from(sphere_radius(41, 1.0, threshold));
    assert_float_eq!(info.volume.unwrap(), 4.0 / 3.0 * PI * r.powi(3), rmax <= 0.03);
    assert_float_eq!(info.surface_area, 4.0 * PI * r * r, rmax <= 0.03);

    let center = info.center_mass.unwrap();
    for c in center {
        assert_float_eq!(c, 20.0, abs <= 0.05);
    }
}

// A 4x4x4 grid of zeros with the given samples raised to one.
fn raised(points: &[[usize; 3]]) -> ScalarField {
    let mut values = vec![0.0; 64];
    for &[i, j, k] in points {
        values[i + 4 * (j + 4 * k)] = 1.0;
    }
    ScalarField::new([4, 4, 4], [1.0; 3], values).unwrap()
}

fn assert_closed(field: &ScalarField, threshold: f32) {
    let mesh = extract(field, threshold, [1.0; 3]).unwrap();
    let info = describe(&mesh);
    assert!(info.is_watertight, "{info:?}");
    assert!(info.is_winding_consistent);
    assert!(info.volume.unwrap() > 0.0);
}

#[test]
fn diagonal_samples_on_a_shared_face_stay_closed() {
    assert_closed(&raised(&[[1, 1, 1], [2, 2, 1]]), 0.5);
}

#[test]
fn opposite_samples_of_a_cell_stay_closed() {
    assert_closed(&raised(&[[1, 1, 1], [2, 2, 2]]), 0.5);
}

#[test]
fn cell_missing_two_diagonal_corners_stays_closed() {
    let mut points = Vec::new();
    for k in 1..3 {
        for j in 1..3 {
            for i in 1..3 {
                if [i, j, k] != [2, 1, 1] && [i, j, k] != [1, 2, 1] {
                    points.push([i, j, k]);
                }
            }
        }
    }
    assert_closed(&raised(&points), 0.5);
}

#[test]
fn noisy_volumes_are_watertight() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let n = 7;
        let mut values = vec![0.0; n * n * n];
        for k in 1..n - 1 {
            for j in 1..n - 1 {
                for i in 1..n - 1 {
                    values[i + n * (j + n * k)] = rng.gen::<f32>();
                }
            }
        }
        let field = ScalarField::new([n; 3], [1.0; 3], values).unwrap();
        if field.values().iter().any(|&v| v > 0.5) {
            assert_closed(&field, 0.5);
        }
    }
}

#[test]
fn normals_point_outward() {
    let field = field(sphere(21, 1.0));
    let mesh = extract(&field, 0.5, [1.0; 3]).unwrap();
    let normals = mesh.normals().unwrap();
    assert_eq!(normals.len(), mesh.vertex_count());
    for (p, n) in mesh.positions().iter().zip(normals) {
        let outward = *p - kiln_mesh::vec3(10.0, 10.0, 10.0);
        assert!(cgmath::dot(outward, *n) > 0.0);
    }
}

#[test]
fn extraction_is_deterministic() {
    let field = field(sphere(15, 0.5));
    let a = extract(&field, 0.4, field.spacing()).unwrap();
    let b = extract(&field, 0.4, field.spacing()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn vertices_follow_the_sweep_order() {
    let field = field(sphere(15, 1.0));
    let mesh = extract(&field, 0.5, [1.0; 3]).unwrap();
    // The first vertex belongs to the lowest z slab the surface reaches.
    let first_z = mesh.positions()[0].z;
    let min_z = mesh.positions().iter().map(|p| p.z).fold(f32::INFINITY, f32::min);
    assert!(first_z - min_z <= 1.0);
}

#[test]
fn spacing_stretches_the_surface() {
    let field = field(sphere(21, 1.0));
    let unit = describe(&extract(&field, 0.5, [1.0; 3]).unwrap());
    let stretched = describe(&extract(&field, 0.5, [2.0, 1.0, 1.0]).unwrap());
    let a = unit.bounding_box.unwrap().size;
    let b = stretched.bounding_box.unwrap().size;
    assert_float_eq!(b[0], 2.0 * a[0], rmax <= 1e-5);
    assert_float_eq!(b[1], a[1], rmax <= 1e-5);
    assert_float_eq!(stretched.volume.unwrap(), 2.0 * unit.volume.unwrap(), rmax <= 1e-4);
}

#[test]
fn pipeline_threshold_matches_statistics() {
    let field = field(sphere(21, 1.0));
    let normalized = normalize(&field).unwrap();
    let threshold = choose_threshold(&normalized);
    assert!(threshold > 0.0 && threshold < 1.0);

    let mesh = field_to_mesh(&field).unwrap();
    assert_eq!(mesh, extract(&normalized, threshold, [1.0; 3]).unwrap());
}

#[test]
fn nifti_scan_to_mesh() {
    // Intensities in scanner units, stored as i16 with 0.8mm voxels.
    let volume = sphere(17, 0.8);
    let scaled = Volume {
        values: volume.values.iter().map(|v| v * 1000.0).collect(),
        ..volume
    };
    let builder = NiftiBuilder {
        datatype: kiln_test_data::NiftiType::I16,
        ..Default::default()
    };
    let field = nifti::decode(&builder.build_gz(&scaled)).unwrap();
    assert_float_eq!(field.spacing()[0], 0.8, abs <= 1e-6);

    let mesh = field_to_mesh(&field).unwrap();
    let info = describe(&mesh);
    assert!(info.is_watertight);
    assert!(info.volume.unwrap() > 0.0);
    assert!(info.bounding_box.unwrap().max[0] <= 16.0 * 0.8);
}

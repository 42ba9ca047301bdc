use std::process::Command;

use kiln_codec::Format;
use kiln_test_data::{calibration_cube, sphere, NiftiBuilder};

fn kiln() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
    cmd.env("RUST_LOG", "warn")
        .env_remove("KILN_DEVICES")
        .env_remove("CUDA_VISIBLE_DEVICES")
        .env_remove("KILN_REQUIRE_ACCELERATOR");
    cmd
}

#[test]
fn convert_writes_next_to_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("cube.stl");
    let cube = kiln_codec::export(&calibration_cube().mesh, Format::Stl).unwrap();
    std::fs::write(&input, cube).unwrap();

    let out = kiln()
        .args(["convert", "--format", "obj", "--prompt", "smoother"])
        .arg(&input)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let obj = std::fs::read_to_string(dir.path().join("cube.obj")).unwrap();
    assert!(obj.starts_with("# written by kiln"));
    let metadata: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(metadata["original_format"], "stl");
    assert_eq!(metadata["target_format"], "obj");
    assert_eq!(metadata["modification_prompt"], "smoother");
    assert_eq!(metadata["mesh_info"]["faces"], 12);
}

#[test]
fn describe_volume() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ball.nii");
    std::fs::write(&input, NiftiBuilder::default().build(&sphere(20, 1.0))).unwrap();

    let out = kiln().arg("describe").arg(&input).output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let info: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(info["is_watertight"], true);
}

#[test]
fn unsupported_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("cube.stl");
    let cube = kiln_codec::export(&calibration_cube().mesh, Format::Stl).unwrap();
    std::fs::write(&input, cube).unwrap();

    let out = kiln()
        .args(["convert", "--format", "xyz"])
        .arg(&input)
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("xyz"));
}

#[test]
fn generate_with_simulated_devices() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("pebble.stl");

    let out = kiln()
        .args(["generate", "--simulate", "2", "--resolution", "20"])
        .args(["--prompt", "a pebble", "--format", "stl", "-o"])
        .arg(&output)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(std::fs::metadata(&output).unwrap().len() > 84);
    let metadata: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(metadata["device"], "cuda:0");
    assert_eq!(metadata["seed"], 2025);
}

#[test]
fn status_lists_devices() {
    let out = kiln().args(["status", "--simulate", "3"]).output().unwrap();
    assert!(out.status.success());
    let status: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["accelerator"]["count"], 3);
    assert_eq!(status["selected_device"], "cuda:0");
}

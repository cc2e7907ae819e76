//! Command line behavior of the emulator binary.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn longan() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_longan"));
    cmd.env("RUST_LOG", "error");
    cmd
}

#[test]
fn missing_firmware_exits_with_status_1() {
    longan()
        .args(["--bios", "nonexistent-path"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Unable to find nonexistent-path"));
}

#[test]
fn oversized_firmware_exits_with_status_1() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("huge.bin"), vec![0u8; 128 * 1024 + 1]).unwrap();

    longan()
        .args(["--bios", "huge.bin", "-L"])
        .arg(dir.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unable to load firmware image huge.bin"));
}

#[test]
fn dump_map_lists_flash_alias_and_sram() {
    longan()
        .arg("--dump-map")
        .assert()
        .success()
        .stdout(predicate::str::contains("0x00000000-0x0001ffff r-x GD32VF103.flash.alias -> GD32VF103.flash"))
        .stdout(predicate::str::contains("0x08000000-0x0801ffff r-x GD32VF103.flash"))
        .stdout(predicate::str::contains("0x20000000-0x20007fff rwx GD32VF103.sram"));
}

#[test]
fn firmware_found_through_search_dir() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("blink.bin"), [0x13u8, 0x00, 0x00, 0x00]).unwrap();

    longan()
        .args(["-M", "longan-nano", "--bios", "blink.bin", "--dump-map", "-L"])
        .arg(dir.path())
        .assert()
        .success();
}

#[test]
fn unknown_machine_is_rejected() {
    longan().args(["-M", "virt"]).assert().failure().stderr(predicate::str::contains("invalid value"));
}

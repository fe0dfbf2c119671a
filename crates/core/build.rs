//! Build script for tarn-core
//!
//! Compresses the boot block into OUT_DIR and exports its uncompressed
//! length, which startup verifies before scanning.

use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

fn main() {
    let src = "src/boot/boot.tarn";
    println!("cargo:rerun-if-changed={src}");

    let text = fs::read(src).expect("boot block source missing");
    println!("cargo:rustc-env=TARN_BOOT_LEN={}", text.len());

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&text).expect("boot block compression failed");
    let compressed = encoder.finish().expect("boot block compression failed");
    fs::write(out_dir.join("boot.tarn.z"), compressed).expect("could not write boot blob");
}

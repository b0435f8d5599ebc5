// Build script to compile the cube's GLSL shaders to SPIR-V
//
// The renderer loads the .spv files from disk at startup, so a missing glslc
// only warns here and the binaries can be produced by hand.

use std::path::Path;
use std::process::Command;

const SHADERS: &[(&str, &str)] = &[
    ("shaders/cube.vert", "shaders/cube.vert.spv"),
    ("shaders/cube.frag", "shaders/cube.frag.spv"),
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/cube.vert");
    println!("cargo:rerun-if-changed=shaders/cube.frag");

    for (input, output) in SHADERS {
        compile_shader(input, output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let result = Command::new("glslc")
        .arg(Path::new(input))
        .arg("-o")
        .arg(Path::new(output))
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} was not compiled", e, input);
            println!("cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}", input, output);
        }
    }
}

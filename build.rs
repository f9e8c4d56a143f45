// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: [(&str, &str); 2] = [
    ("shaders/mesh.vert", "shaders/mesh.vert.spv"),
    ("shaders/mesh.frag", "shaders/mesh.frag.spv"),
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile shaders using glslc (part of Vulkan SDK)
    for (input, output) in SHADERS {
        compile_shader(input, output);
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    if !input_path.exists() {
        println!("cargo:warning=Shader source {} is missing", input);
        return;
    }

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(Path::new(output))
        .status();

    // The renderer reads SPIR-V at runtime, so a failed compile only matters
    // once the binary starts
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=Failed to compile {}: exit code {:?}",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), shaders not compiled", e);
            println!("cargo:warning=Install the Vulkan SDK or run: glslc {} -o {}", input, output);
        }
    }
}

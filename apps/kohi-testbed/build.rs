//! Build script to compile the builtin GLSL shaders to SPIR-V.
//!
//! Stages are written next to their sources as `<name>.<stage>.spv`, where the
//! renderer's resource loader expects them under the asset root.

use shaderc::{Compiler, ShaderKind};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Shaders the testbed draws with, by name.
const SHADERS: &[&str] = &["Builtin.ObjectShader"];

/// Stage file suffixes and their shader kinds.
const STAGES: &[(&str, ShaderKind)] = &[
    ("vert", ShaderKind::Vertex),
    ("frag", ShaderKind::Fragment),
];

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let asset_root = manifest_dir.join("../../assets");
    let shader_dir = asset_root.join("shaders");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for name in SHADERS {
        for (suffix, kind) in STAGES {
            let input = shader_dir.join(format!("{name}.{suffix}"));
            if !input.exists() {
                continue;
            }
            println!("cargo:rerun-if-changed={}", input.display());
            compile_shader(
                &compiler,
                &input,
                &shader_dir.join(format!("{name}.{suffix}.spv")),
                *kind,
            );
        }
    }

    // Lets the testbed find the assets wherever it is launched from.
    let asset_root = asset_root.canonicalize().unwrap_or(asset_root);
    println!("cargo:rustc-env=KOHI_ASSET_ROOT={}", asset_root.display());
}

fn compile_shader(compiler: &Compiler, input_path: &Path, output_path: &Path, kind: ShaderKind) {
    let source = fs::read_to_string(input_path)
        .unwrap_or_else(|e| panic!("Failed to read shader {:?}: {}", input_path, e));

    let file_name = input_path.file_name().unwrap().to_str().unwrap();

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let result = compiler
        .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {:?}: {}", input_path, e));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {:?}: {}",
            input_path,
            result.get_warning_messages()
        );
    }

    let binary = bytemuck::cast_slice::<u32, u8>(result.as_binary());

    // Skip the write when nothing changed so the source stays the newest file.
    if fs::read(output_path).is_ok_and(|existing| existing == binary) {
        return;
    }
    fs::write(output_path, binary)
        .unwrap_or_else(|e| panic!("Failed to write shader {:?}: {}", output_path, e));
}

// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. build.rs compiles the GLSL sources in
// shaders/ with glslc; here we read the .spv files at runtime.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::VulkanDevice;

/// Decode SPIR-V bytes into aligned 32-bit words, checking the magic number
pub fn read_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V bytecode")
}

/// Create a shader module from SPIR-V bytes
pub fn create_shader_module(device: &VulkanDevice, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = read_spirv(bytes)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Load a compiled shader from disk
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?}. Was it compiled with glslc?", path))?;

    log::debug!("Loaded shader {:?} ({} bytes)", path, bytes.len());
    create_shader_module(device, &bytes).with_context(|| format!("Shader {:?}", path))
}

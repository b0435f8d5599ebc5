// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The cube's shaders are compiled by
// build.rs and read from disk at startup (and again on hot reload).

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use super::VulkanDevice;

/// Decode SPIR-V bytes into words, checking size and magic number
pub fn read_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V")
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a compiled shader from disk and create its module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?} (was it compiled?)", path))?;
    let words = read_spirv(&bytes).with_context(|| format!("Failed to decode shader {:?}", path))?;

    log::debug!("Loaded shader {:?} ({} words)", path, words.len());

    create_shader_module(device, &words).with_context(|| format!("Shader {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn accepts_word_aligned_spirv() {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC, 0x0001_0000, 0, 8, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let words = read_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn rejects_truncated_or_empty_input() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(read_spirv(&bytes).is_err());
        assert!(read_spirv(&[]).is_err());
    }

    #[test]
    fn rejects_non_spirv() {
        assert!(read_spirv(b"#version 450\n\0\0\0").is_err());
    }
}

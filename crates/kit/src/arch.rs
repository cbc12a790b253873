//! Architecture detection for QEMU emulator selection
//!
//! Avoids hardcoding the host architecture when building the emulator
//! command line.

use color_eyre::Result;

/// Emulator configuration for the host architecture
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArchConfig {
    /// Architecture string (e.g., "x86_64", "aarch64")
    pub(crate) arch: &'static str,
    /// QEMU machine type (e.g., "q35", "virt")
    pub(crate) machine: &'static str,
    /// QEMU emulator binary, looked up in `PATH`
    pub(crate) emulator: &'static str,
    /// UEFI firmware, for machine types without a default one
    pub(crate) firmware: Option<&'static str>,
}

impl ArchConfig {
    /// Detect host architecture and return appropriate configuration
    pub(crate) fn detect() -> Result<Self> {
        Self::for_arch(std::env::consts::ARCH)
    }

    pub(crate) fn for_arch(arch: &str) -> Result<Self> {
        match arch {
            "x86_64" => Ok(Self {
                arch: "x86_64",
                machine: "q35",
                emulator: "qemu-system-x86_64",
                firmware: None,
            }),
            "aarch64" => Ok(Self {
                arch: "aarch64",
                machine: "virt",
                emulator: "qemu-system-aarch64",
                firmware: Some("edk2-aarch64-code.fd"),
            }),
            unsupported => Err(color_eyre::eyre::eyre!(
                "Unsupported architecture: {}. Supported architectures: x86_64, aarch64",
                unsupported
            )),
        }
    }

    /// Check if the QEMU emulator exists on the system
    pub(crate) fn validate_emulator(&self) -> Result<()> {
        if which::which(self.emulator).is_err() {
            return Err(color_eyre::eyre::eyre!(
                "QEMU emulator not found: {}. Please install the appropriate QEMU package for {} architecture.",
                self.emulator,
                self.arch
            ));
        }
        Ok(())
    }

    /// Accelerators to try, best first; QEMU uses the first that works.
    pub(crate) fn accelerators(&self) -> &'static [&'static str] {
        if cfg!(target_os = "macos") {
            &["hvf", "tcg"]
        } else {
            &["kvm", "tcg"]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_detection() {
        let arch_config = ArchConfig::detect().unwrap();
        assert_eq!(arch_config.arch, std::env::consts::ARCH);
        assert!(!arch_config.machine.is_empty());
        assert!(arch_config.emulator.starts_with("qemu-system-"));
    }

    #[test]
    fn test_arch_specific() {
        let x86 = ArchConfig::for_arch("x86_64").unwrap();
        assert_eq!(x86.machine, "q35");
        assert!(x86.firmware.is_none());
        let arm = ArchConfig::for_arch("aarch64").unwrap();
        assert_eq!(arm.machine, "virt");
        assert!(arm.firmware.is_some());
        assert!(ArchConfig::for_arch("riscv64").is_err());
        assert_eq!(x86.accelerators().last(), Some(&"tcg"));
    }

    #[test]
    fn test_missing_emulator_rejected() {
        let cfg = ArchConfig {
            emulator: "qemu-system-surely-not-installed",
            ..ArchConfig::for_arch("x86_64").unwrap()
        };
        let err = cfg.validate_emulator().unwrap_err();
        assert!(err.to_string().contains("qemu-system-surely-not-installed"));
    }
}

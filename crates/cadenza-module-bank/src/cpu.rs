use bitflags::bitflags;

bitflags! {
    /// Hardware capability flags a module may require.
    ///
    /// The numeric values are part of the plugin ABI and the cache
    /// format: plugins declare `required_cpu` as these raw bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuFeatures: u32 {
        const SSE2   = 1;
        const SSE4_1 = 1 << 1;
        const AVX    = 1 << 2;
        const AVX2   = 1 << 3;
        const FMA    = 1 << 4;
        const NEON   = 1 << 5;
    }
}

impl CpuFeatures {
    /// Probe the running CPU once; the bank caches the result.
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            let mut features = CpuFeatures::empty();
            if std::arch::is_x86_feature_detected!("sse2") {
                features |= CpuFeatures::SSE2;
            }
            if std::arch::is_x86_feature_detected!("sse4.1") {
                features |= CpuFeatures::SSE4_1;
            }
            if std::arch::is_x86_feature_detected!("avx") {
                features |= CpuFeatures::AVX;
            }
            if std::arch::is_x86_feature_detected!("avx2") {
                features |= CpuFeatures::AVX2;
            }
            if std::arch::is_x86_feature_detected!("fma") {
                features |= CpuFeatures::FMA;
            }
            features
        }
        #[cfg(target_arch = "aarch64")]
        {
            CpuFeatures::NEON
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        {
            CpuFeatures::empty()
        }
    }

    /// Whether every bit in `required` is present.
    pub fn supports(self, required: CpuFeatures) -> bool {
        self.contains(required)
    }

    pub fn from_bits_lossy(bits: u32) -> Self {
        CpuFeatures::from_bits_truncate(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_is_subset_check() {
        let cpu = CpuFeatures::SSE2 | CpuFeatures::AVX;
        assert!(cpu.supports(CpuFeatures::empty()));
        assert!(cpu.supports(CpuFeatures::SSE2));
        assert!(cpu.supports(CpuFeatures::SSE2 | CpuFeatures::AVX));
        assert!(!cpu.supports(CpuFeatures::AVX2));
        assert!(!cpu.supports(CpuFeatures::SSE2 | CpuFeatures::AVX2));
    }

    #[test]
    fn detect_does_not_panic() {
        let _ = CpuFeatures::detect();
    }
}

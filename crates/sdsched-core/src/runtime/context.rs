//! Execution context: the device and precision compiled modules run on.

use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::device::{DeviceKind, DeviceProfile, DeviceSelector};
use crate::config::{Precision, RuntimeConfig};
use crate::error::Result;

/// Destination device plus the precision every wrapped tensor is cast to.
///
/// `wrap` and `unwrap` are the only host/device transfer points. Both copy
/// and both cast: `wrap` to the context precision, `unwrap` to F32 for host
/// numerics.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    device: Device,
    kind: DeviceKind,
    precision: Precision,
}

impl ExecutionContext {
    pub fn new(profile: DeviceProfile, precision: Precision) -> Self {
        Self {
            device: profile.device,
            kind: profile.kind,
            precision,
        }
    }

    pub fn cpu(precision: Precision) -> Self {
        Self::new(DeviceProfile::cpu(), precision)
    }

    pub fn from_runtime(runtime: &RuntimeConfig, precision: Precision) -> Result<Self> {
        let profile = DeviceSelector::detect_with_preference(runtime.device.as_deref())?;
        Ok(Self::new(profile, precision))
    }

    pub fn with_precision(&self, precision: Precision) -> Self {
        Self {
            precision,
            ..self.clone()
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    pub fn is_resident(&self, tensor: &Tensor) -> bool {
        tensor.device().same_device(&self.device)
    }

    /// Copy a host tensor onto the context device at the context precision.
    pub fn wrap(&self, host: &Tensor) -> Result<Tensor> {
        Ok(host.to_device(&self.device)?.to_dtype(self.dtype())?)
    }

    /// Copy a device tensor to the host as F32.
    pub fn unwrap(&self, device_tensor: &Tensor) -> Result<Tensor> {
        let host = device_tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        if device_tensor.dtype() != DType::F32 {
            debug!("unwrap: {:?} -> F32 on host", device_tensor.dtype());
        }
        Ok(host)
    }

    /// F32 rank-0 tensor on the context device.
    pub fn scalar(&self, value: f64) -> Result<Tensor> {
        Ok(Tensor::new(value as f32, &self.device)?)
    }

    /// I64 rank-0 tensor on the context device.
    pub fn index(&self, value: usize) -> Result<Tensor> {
        Ok(Tensor::new(value as i64, &self.device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_casts_to_context_precision() {
        let ctx = ExecutionContext::cpu(Precision::Half);
        let host = Tensor::new(&[1.5f32, -2.25], &Device::Cpu).unwrap();
        let wrapped = ctx.wrap(&host).unwrap();
        assert_eq!(wrapped.dtype(), DType::F16);
        assert!(ctx.is_resident(&wrapped));

        let back = ctx.unwrap(&wrapped).unwrap();
        assert_eq!(back.dtype(), DType::F32);
        assert_eq!(back.to_vec1::<f32>().unwrap(), vec![1.5, -2.25]);
    }

    #[test]
    fn scalars_live_on_context_device() {
        let ctx = ExecutionContext::cpu(Precision::Full);
        assert_eq!(ctx.index(3).unwrap().to_scalar::<i64>().unwrap(), 3);
        assert_eq!(ctx.scalar(7.5).unwrap().to_scalar::<f32>().unwrap(), 7.5);
        assert_eq!(ctx.scalar(7.5).unwrap().dims(), &[] as &[usize]);
    }
}

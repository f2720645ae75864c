use std::thread::JoinHandle;

use itertools::Itertools;

use super::device::{Device, DeviceBuilder, DeviceKind, ErrorHandler, MemoryKind, QueueError};

/// Spawns a named OS thread serving a queue's stream.
#[inline]
pub fn spawn_worker<F>(name: String, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name).spawn(f)
}

/// The set of devices available to the process.
///
/// Device `0` is the host CPU, which shares memory with the application.
/// The remaining devices are discrete CPUs used to exercise data migration.
#[derive(Debug, Clone)]
pub struct Platform {
    devices: Vec<Device>,
}

impl Platform {
    #[inline]
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::default()
    }

    /// The host CPU.
    #[inline]
    pub fn host(&self) -> &Device {
        &self.devices[0]
    }

    #[inline]
    pub fn device(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    #[inline]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Default, Clone)]
pub struct PlatformBuilder {
    pub cpu: DeviceKind,
    pub test_devices: usize,
    pub test_device_kind: Option<DeviceKind>,
    pub handler: Option<ErrorHandler>,
}

impl PlatformBuilder {
    /// How the host CPU executes work.
    pub fn cpu(mut self, kind: DeviceKind) -> Self {
        self.cpu = kind;
        self
    }

    /// Adds `count` discrete CPUs, named `cpu:1` onwards.
    pub fn test_devices(mut self, count: usize) -> Self {
        self.test_devices = count;
        self
    }

    /// How the discrete CPUs execute work. Asynchronous unless set.
    pub fn test_device_kind(mut self, kind: DeviceKind) -> Self {
        self.test_device_kind = Some(kind);
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Device, &QueueError) + Send + Sync + 'static,
    {
        self.handler = Some(std::sync::Arc::new(handler));
        self
    }

    pub fn build(self) -> Platform {
        let Self {
            cpu,
            test_devices,
            test_device_kind,
            handler,
        } = self;
        let test_device_kind = test_device_kind.unwrap_or(DeviceKind::CpuAsync);

        let build = |builder: DeviceBuilder| match &handler {
            Some(handler) => DeviceBuilder {
                handler: Some(handler.clone()),
                ..builder
            }
            .build(),
            None => builder.build(),
        };

        let host = build(DeviceBuilder::new(0).kind(cpu));
        let devices = (1..=test_devices).map(|id| {
            build(
                DeviceBuilder::new(id)
                    .kind(test_device_kind)
                    .memory(MemoryKind::Discrete),
            )
        });
        let devices: Vec<_> = std::iter::once(host).chain(devices).collect();

        log::debug!(
            "platform: {}",
            devices
                .iter()
                .map(|device| format!("{}({})", device.name(), device.kind()))
                .format(", ")
        );
        Platform { devices }
    }
}

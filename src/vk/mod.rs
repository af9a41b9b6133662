pub mod accel;
pub mod backend;
pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod present;
pub mod swapchain;

pub use backend::VulkanBackend;
pub use device::VulkanDevice;
pub use instance::VulkanInstance;
pub use swapchain::Swapchain;

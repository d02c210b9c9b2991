mod device;
pub use device::Device;

mod queue;
pub use queue::CommandQueue;

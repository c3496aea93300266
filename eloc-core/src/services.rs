//! Collaborator seams for hardware services the core consumes but does not
//! own. The host firmware injects real implementations at construction;
//! tests substitute fakes. No singleton accessors — everything arrives as a
//! handle.

use std::path::Path;

/// Removable-storage mount service.
pub trait StorageService: Send + 'static {
    /// Is the storage device mounted and writable?
    fn is_mounted(&self) -> bool;

    /// Free space remaining, in gigabytes.
    fn free_space_gb(&self) -> f32;

    /// Mount point recordings are placed under.
    fn root(&self) -> &Path;
}

/// Battery/power-management service.
pub trait PowerService: Send + 'static {
    /// Current battery voltage, in volts.
    fn voltage(&self) -> f32;

    /// Has the battery reached the critical cutoff?
    fn is_critically_low(&self) -> bool;

    /// Ask the power manager to enter low-power sleep once the session has
    /// been torn down.
    fn request_low_power_sleep(&self);
}

//! Opaque device handles.
//!
//! Handles are plain tokens minted by a [`RayTracingDevice`](crate::RayTracingDevice).
//! They carry no ownership: every handle is released with the matching
//! `*_destroy` or `free` call on the device that created it.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address in device memory.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device address.
    pub const NULL: Self = Self(0);

    /// Returns true for the null address.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of a device allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// A raw device allocation: identity, base address and size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawBuffer {
    pub id: BufferId,
    pub ptr: DevicePtr,
    pub size: u64,
}

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Wrap a raw device value. Only device implementations should call this.
            #[inline]
            #[must_use]
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            /// Raw device value.
            #[inline]
            #[must_use]
            pub const fn as_raw(self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// Device program module created from a program blob.
    ModuleHandle
);
opaque_handle!(
    /// Program group bound to one stage and its entry points.
    ProgramGroupHandle
);
opaque_handle!(
    /// Linked executable pipeline.
    PipelineHandle
);

/// Traversable acceleration structure, as seen by device programs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct TraversableHandle(pub u64);

impl TraversableHandle {
    /// Handle that references nothing.
    pub const NULL: Self = Self(0);

    /// Returns true for the null handle.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

use crate::StateError;

bitflags::bitflags! {
    ///Usage state of a buffer or texture. Uses the native bit values, so the flags can be passed through to the API
    /// unchanged.
    ///
    /// Read-only states can be combined freely (for instance `VERTEX_AND_CONSTANT_BUFFER | COPY_SOURCE`). Write states
    /// have to stand alone. Use [validate](GfxResourceState::validate) before handing a state to the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GfxResourceState: u32 {
        const COMMON = 0;
        const PRESENT = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        ///Required state of upload heap resources.
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
    }
}

impl Default for GfxResourceState {
    fn default() -> Self {
        GfxResourceState::COMMON
    }
}

impl GfxResourceState {
    ///All states the GPU may write in. Each of them has to be used exclusively.
    pub const WRITE: Self = Self::RENDER_TARGET
        .union(Self::UNORDERED_ACCESS)
        .union(Self::DEPTH_WRITE)
        .union(Self::STREAM_OUT)
        .union(Self::COPY_DEST)
        .union(Self::RESOLVE_DEST);

    ///Builds a state from raw bits, validating them.
    pub fn try_from_bits(bits: u32) -> Result<Self, StateError> {
        Self::from_bits(bits)
            .ok_or(StateError::UnknownBits(bits & !Self::all().bits()))?
            .validate()
    }

    ///Checks that no write state is combined with any other state and that no unknown bits are set.
    pub fn validate(self) -> Result<Self, StateError> {
        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            return Err(StateError::UnknownBits(unknown));
        }

        let write = self.intersection(Self::WRITE);
        if !write.is_empty() && (write != self || write.bits().count_ones() > 1) {
            return Err(StateError::ExclusiveWrite(self));
        }

        Ok(self)
    }

    ///True for the common (= present) state.
    #[inline]
    pub fn is_common(&self) -> bool {
        self.is_empty()
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        !self.intersects(Self::WRITE)
    }

    ///True if `self` allows every access `required` allows. Used to check read states like `COPY_SOURCE`
    /// against composite states like `GENERIC_READ`.
    #[inline]
    pub fn allows(&self, required: GfxResourceState) -> bool {
        if required.is_common() {
            self.is_common()
        } else {
            self.contains(required)
        }
    }
}

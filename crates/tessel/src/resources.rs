mod buffer;
pub use buffer::{BufDesc, Buffer, MemoryUsage};

mod command_list;
pub use command_list::{GraphicsCommandList, ListState};

mod pipeline;
pub use pipeline::{GraphicsState, PipelineKind, PipelineStateDesc};

mod state;
pub use state::GfxResourceState;

mod texture;
pub use texture::{
    Format, SubresourceFootprint, TEXTURE_DATA_PITCH_ALIGNMENT, TEXTURE_DATA_PLACEMENT_ALIGNMENT, TexDesc, TexUsage,
    Texture, copyable_footprints,
};

mod views;
pub use views::{IndexBufferView, IndexFormat, PrimitiveTopology, ScissorRect, VertexBufferView, Viewport};

//! Normalized descriptors produced by the parser.
//!
//! These are the in-memory forms of the compiler's section, sub-section
//! and tensor tables. The job builder consumes them verbatim; nothing
//! here touches device memory.

use bytes::Bytes;

/// Sub-section / buffer type codes emitted by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionType {
    /// Static constant data (weights, bias).
    Constant,
    /// Zero-copy constant data.
    ZeroCopyConstant,
    /// Input tensor.
    Input,
    /// Output tensor.
    Output,
    /// Intermediate dump tensor.
    InterDump,
    /// Profiler data buffer.
    Profiler,
    /// Printf log buffer.
    Printf,
    /// Layer counter buffer.
    LayerCounter,
    /// Error code buffer.
    ErrorCode,
    /// SegMMU-tagged buffer.
    SegMmu,
    /// Output-tensor-shape buffer (dynamic shape).
    OutTensorShape,
}

impl SectionType {
    /// Decode a raw type code.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Constant),
            1 => Some(Self::ZeroCopyConstant),
            2 => Some(Self::Input),
            3 => Some(Self::Output),
            4 => Some(Self::InterDump),
            5 => Some(Self::Profiler),
            6 => Some(Self::Printf),
            7 => Some(Self::LayerCounter),
            8 => Some(Self::ErrorCode),
            9 => Some(Self::SegMmu),
            10 => Some(Self::OutTensorShape),
            _ => None,
        }
    }

    /// Raw type code of this variant.
    pub fn code(self) -> u32 {
        match self {
            Self::Constant => 0,
            Self::ZeroCopyConstant => 1,
            Self::Input => 2,
            Self::Output => 3,
            Self::InterDump => 4,
            Self::Profiler => 5,
            Self::Printf => 6,
            Self::LayerCounter => 7,
            Self::ErrorCode => 8,
            Self::SegMmu => 9,
            Self::OutTensorShape => 10,
        }
    }

    /// True for sub-section types that describe an I/O tensor.
    pub fn is_io_tensor(self) -> bool {
        !matches!(self, Self::Constant | Self::ZeroCopyConstant)
    }
}

/// Tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DataType {
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    F16,
    BF16,
    F32,
}

impl DataType {
    /// Decode a raw data-type code; unknown codes default to `U8`.
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::S8,
            2 => Self::U16,
            3 => Self::S16,
            4 => Self::U32,
            5 => Self::S32,
            6 => Self::F16,
            7 => Self::BF16,
            8 => Self::F32,
            _ => Self::U8,
        }
    }

    /// Raw code of this variant.
    pub fn code(self) -> u32 {
        match self {
            Self::U8 => 0,
            Self::S8 => 1,
            Self::U16 => 2,
            Self::S16 => 3,
            Self::U32 => 4,
            Self::S32 => 5,
            Self::F16 => 6,
            Self::BF16 => 7,
            Self::F32 => 8,
        }
    }

    /// Element width in bytes.
    pub fn bytes_per_element(self) -> u64 {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 | Self::F16 | Self::BF16 => 2,
            Self::U32 | Self::S32 | Self::F32 => 4,
        }
    }
}

/// One sub-section view within a section.
#[derive(Debug, Clone)]
pub struct SubSectionDesc {
    /// Offset of the sub-section within its parent section.
    pub offset_in_section: u32,
}

/// A compiler-produced memory region requirement.
#[derive(Debug, Clone)]
pub struct SectionDesc {
    /// Payload size in bytes.
    pub size: u32,
    /// Required alignment in pages.
    pub align_in_page: u32,
    /// Offset of the load image within the weight file region.
    pub offset_in_file: u32,
    /// Region type (constant, zero-copy constant, or reuse carrier).
    pub sec_type: SectionType,
    /// Placement within the const / zero-copy-const bucket.
    pub relative_addr: u32,
    /// File bytes to load for static sections.
    pub load_src: Option<Bytes>,
    /// Sub-section table.
    pub sub_sections: Vec<SubSectionDesc>,
    /// Index within the owning table.
    pub slot_index: u32,
}

impl SectionDesc {
    /// An empty descriptor, filled in by the parser.
    pub fn new() -> Self {
        Self {
            size: 0,
            align_in_page: 1,
            offset_in_file: 0,
            sec_type: SectionType::Constant,
            relative_addr: 0,
            load_src: None,
            sub_sections: Vec::new(),
            slot_index: 0,
        }
    }
}

impl Default for SectionDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// An I/O tensor view into a reuse section.
#[derive(Debug, Clone)]
pub struct IoTensorDesc {
    /// Compiler-declared tensor id; the parser enforces `id == position`.
    pub id: u32,
    /// Tensor byte size.
    pub size: u32,
    /// Index of the carrying reuse section.
    pub ref_section_iter: u32,
    /// Offset within the reuse section.
    pub offset_in_section: u32,
    /// Quantization scale.
    pub scale: f32,
    /// Quantization zero point.
    pub zero_point: i32,
    /// Element type.
    pub data_type: DataType,
}

/// The full I/O tensor set of a graph.
#[derive(Debug, Clone, Default)]
pub struct IoTensors {
    /// Input tensors, ordered by id.
    pub inputs: Vec<IoTensorDesc>,
    /// Output tensors, ordered by id.
    pub outputs: Vec<IoTensorDesc>,
    /// Intermediate dump tensors, ordered by id.
    pub inter_dumps: Vec<IoTensorDesc>,
    /// Profiler buffers.
    pub profiler: Vec<IoTensorDesc>,
    /// Printf buffers.
    pub printf: Vec<IoTensorDesc>,
    /// Layer counter buffers.
    pub layer_counter: Vec<IoTensorDesc>,
    /// Error code buffers.
    pub err_code: Vec<IoTensorDesc>,
    /// SegMMU-tagged buffers.
    pub segmmus: Vec<IoTensorDesc>,
    /// Output-shape tensors, ordered by id.
    pub outputs_shape: Vec<IoTensorDesc>,
}

/// Where a relocated address comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocLoadType {
    /// Resolve against a weight buffer.
    Static,
    /// Resolve against a reuse buffer.
    Reuse,
}

/// One parameter-relocation entry: patch `rodata[offset_in_ro]` with the
/// resolved physical address under `addr_mask`.
#[derive(Debug, Clone)]
pub struct ParamReloc {
    /// Patch location within the rodata (or descriptor) image.
    pub offset_in_ro: u32,
    /// Address source kind.
    pub load_type: RelocLoadType,
    /// Originating sub-section type.
    pub sub_type: SectionType,
    /// Index into the static or reuse buffer list.
    pub buf_index: u32,
    /// Sub-section index within the section.
    pub sub_index: u32,
    /// Offset added to the resolved base.
    pub offset_in_section: u32,
    /// Bits of the rodata word owned by the address.
    pub addr_mask: u32,
}

/// One `.remap` entry, applied when the header enables remap.
#[derive(Debug, Clone, Copy)]
pub struct RemapEntry {
    /// Control word.
    pub ctrl: u32,
    /// Source (rodata offset) of the remapped word.
    pub src_addr: u32,
    /// Replacement value.
    pub dst_addr: u32,
}

/// GM buffer selector: reuse buffers.
pub const GM_BUF_TYPE_REUSE: u32 = 0;
/// GM buffer selector: static (weight) buffers.
pub const GM_BUF_TYPE_WEIGHT: u32 = 1;

/// Buffer index reference in the GM config note.
#[derive(Debug, Clone, Copy, Default)]
pub struct BssBufferIndex {
    /// Feature-map list index.
    pub fm_index: u32,
    /// [`GM_BUF_TYPE_REUSE`] or [`GM_BUF_TYPE_WEIGHT`].
    pub buf_type: u32,
    /// Index within the selected buffer list.
    pub buf_index: u32,
}

/// Parsed `.note.tnpu.gmconfig` payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct GmConfig {
    /// GM control word; non-zero enables the GM path.
    pub gm_control: u32,
    /// Per-region control words.
    pub gm_region_ctrl: [u32; 2],
    /// Buffers assigned to the GM regions.
    pub gm_buf_idx: [BssBufferIndex; 2],
}

/// Parsed SegMMU configuration (one per core).
#[derive(Debug, Clone, Copy, Default)]
pub struct SegMmuConfig {
    /// Segment control words: 4 segments × 2 controls.
    pub seg: [[u32; 2]; 4],
    /// SegMMU control.
    pub ctl: u32,
    /// SegMMU remap control.
    pub remap: u32,
}

/// Parsed `.note.tnpu.globalparam` header.
#[derive(Debug, Clone, Copy)]
pub struct ModelGlobalParam {
    /// Offset of the input-shape array within the section.
    pub input_shape_offset: u32,
    /// Number of parameter words following the header.
    pub num_params: u32,
}

/// View of a subgraph into one of the graph-wide sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubgraphSection {
    /// Offset within the parent section.
    pub offset: u32,
    /// View size.
    pub size: u32,
}

/// Precursor count value meaning "wait for every earlier subgraph".
pub const PRE_ALL: i32 = -1;

/// One subgraph of the compiled graph.
#[derive(Debug, Clone)]
pub struct Subgraph {
    /// Subgraph id (chain order).
    pub id: u32,
    /// Owning BSS index.
    pub bss_idx: u32,
    /// Text view.
    pub text: SubgraphSection,
    /// Rodata view.
    pub rodata: SubgraphSection,
    /// Descriptor view.
    pub dcr: SubgraphSection,
    /// Per-subgraph printf fifo bytes (0 disables printf).
    pub printfifo_size: u32,
    /// Profiler buffer offset step.
    pub profiler_buf_size: u32,
    /// Per-task private data bytes.
    pub private_data_size: u32,
    /// Instruction-cache warmup length.
    pub warmup_len: u32,
    /// Number of precursors: 0, 1..=4, or [`PRE_ALL`].
    pub precursor_cnt: i32,
    /// Precursor subgraph ids.
    pub precursors: Vec<u32>,
    /// Private (workspace) buffer requirements.
    pub private_buffers: Vec<SectionDesc>,
    /// Relocation entries resolving against the private buffers.
    pub private_buffers_map: Vec<ParamReloc>,
}

/// Stack and static-section requirements of one BSS bucket.
#[derive(Debug, Clone)]
pub struct Bss {
    /// BSS id.
    pub id: u32,
    /// Per-task stack bytes.
    pub stack_size: u32,
    /// Stack alignment in pages.
    pub stack_align_in_page: u32,
    /// Const bucket footprint (placement of static sections).
    pub const_size: u32,
    /// Zero-copy const bucket footprint.
    pub zerocpy_const_size: u32,
    /// Static (weight) sections in slot order.
    pub static_sections: Vec<SectionDesc>,
}

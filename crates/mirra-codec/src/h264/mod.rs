//! H.264 码流解析, 参考帧管理与 slice 解码状态机.

mod backend;
mod decoder;
mod dpb;
mod marking;
mod nal;
mod params;
mod poc;
mod pps;
mod reorder;
mod scaling;
mod session;
mod slice;
mod sps;


pub use backend::{
    BitstreamSlot, DecodeBackend, DecodeSubmission, ReferenceSlot, SessionCaps, SessionDescriptor,
};
pub use decoder::{DecoderStats, OutputPicture, SliceDecoder, SliceDecoderConfig};
pub use dpb::{AcquireKind, DpbManager, DpbSlot};
pub use marking::{MarkingOutcome, ReferenceMarker};
pub use nal::{
    AnnexBSplitter, NalUnit, NalUnitType, add_emulation_prevention, parse_annex_b,
    remove_emulation_prevention, split_annex_b,
};
pub use params::ParameterSets;
pub use poc::PocCalculator;
pub use pps::{Pps, parse_pps};
pub use reorder::{PendingFrame, ReorderBuffer};
pub use scaling::ScalingLists;
pub use session::{DecodeSession, close_session, open_session};
pub use slice::{
    DecRefPicMarking, MAX_MMCO_OPS, MmcoCommand, RefPicListModification, SliceHeader, SliceType,
    parse_slice_header, parse_slice_header_with, peek_pps_id,
};
pub use sps::{Sps, Vui, parse_sps};

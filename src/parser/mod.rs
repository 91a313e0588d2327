//! HTML parsing: bounded text extraction, soft-404 detection and
//! internal-link selection.

pub mod html;
pub mod links;

pub use html::{body_signature, decode_body, extract_text, looks_like_soft_404};
pub use links::{select_subpages, LinkSelection};

pub mod build_info;
pub mod crypto;
pub mod response;
pub mod text;

// B站上传接口模块
//
// 只包含上传相关的 HTTP 客户端、响应数据类型和上传线路表

pub mod client;
pub mod lines;
pub mod types;

pub use client::BiliClient;
pub use lines::{
    default_lines, find_line, parse_line_config, parse_line_params, UploadLine, UPLOAD_LINES,
};
pub use types::*;

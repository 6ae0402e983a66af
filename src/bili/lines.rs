// 上传线路表
//
// 线路名格式为 zone_upcdn（如 cs_txa），kodo/app 为独立的上传方式

/// 上传线路
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLine {
    /// 线路名称
    pub name: &'static str,
    /// 显示名称
    pub display_name: &'static str,
    /// 上传方式: upos, kodo, app
    pub backend: &'static str,
    /// CDN 标识（UPOS 专用）
    pub cdn: &'static str,
    pub description: &'static str,
}

const fn upos(
    name: &'static str,
    display_name: &'static str,
    cdn: &'static str,
    description: &'static str,
) -> UploadLine {
    UploadLine {
        name,
        display_name,
        backend: "upos",
        cdn,
        description,
    }
}

/// 所有可用线路
pub const UPLOAD_LINES: &[UploadLine] = &[
    // 百度云
    upos("cs_bda2", "百度云-BDA2", "bda2", "百度云BDA2线路（推荐）"),
    upos("cs_bldsa", "百度云-BLDSA", "bldsa", "百度云BLDSA线路"),
    // 腾讯云
    upos("cs_tx", "腾讯云-TX", "tx", "腾讯云TX线路"),
    upos("cs_estx", "腾讯云-ESTX", "estx", "腾讯云ESTX线路（新）"),
    upos("cs_txa", "腾讯云-TXA", "txa", "腾讯云TXA线路"),
    // 阿里云
    upos("cs_alia", "阿里云-ALIA", "alia", "阿里云ALIA线路"),
    upos("cs_cnbldsa", "中国大陆-B站自建", "cnbldsa", "B站自建线路"),
    upos("cs_cnbd", "中国大陆-百度云", "cnbd", "中国大陆百度云"),
    UploadLine {
        name: "kodo",
        display_name: "七牛云Kodo",
        backend: "kodo",
        cdn: "",
        description: "七牛云Kodo上传",
    },
    UploadLine {
        name: "app",
        display_name: "App上传",
        backend: "app",
        cdn: "",
        description: "App端上传（小文件）",
    },
];

/// 按名称查找线路
pub fn find_line(name: &str) -> Option<&'static UploadLine> {
    UPLOAD_LINES.iter().find(|line| line.name == name)
}

/// 默认推荐的线路列表
pub fn default_lines() -> Vec<&'static str> {
    vec!["cs_bda2", "cs_tx", "cs_bldsa", "cs_estx", "cs_cnbldsa", "kodo"]
}

/// 解析逗号分隔的线路配置，为空时返回默认列表
pub fn parse_line_config(config: &str) -> Vec<String> {
    let lines: Vec<String> = config
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if lines.is_empty() {
        default_lines().into_iter().map(str::to_string).collect()
    } else {
        lines
    }
}

/// 从线路名解析 zone 和 upcdn
///
/// cs_txa -> (cs, txa)，jd_bd -> (jd, bd)；无法解析时为 (cs, ws)
pub fn parse_line_params(line: &str) -> (String, String) {
    let mut parts = line.split('_');
    match (parts.next(), parts.next()) {
        (Some(zone), Some(upcdn)) if line != "app" => (zone.to_string(), upcdn.to_string()),
        _ => ("cs".to_string(), "ws".to_string()),
    }
}

//! 目标文件命名
//!
//! 文件名来源优先级：Wish 指定 → 地址最后一段 → 标题 → "download"。
//! 所有候选都先经过清洗，再按 MIME 补扩展名，最后解决重名。

use crate::model::Wish;
use reqwest::Url;
use std::path::{Path, PathBuf};

/// 兜底文件名
pub const FALLBACK_NAME: &str = "download";

/// 文件名最大字节数
const MAX_NAME_BYTES: usize = 255;

const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// 清洗文件名：去掉路径分隔符、保留字符、控制字符，以及首尾的点和空白
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !FORBIDDEN.contains(c) && !c.is_control())
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());

    let mut out = String::with_capacity(trimmed.len().min(MAX_NAME_BYTES));
    for c in trimmed.chars() {
        if out.len() + c.len_utf8() > MAX_NAME_BYTES {
            break;
        }
        out.push(c);
    }
    // 截断后末尾可能又出现点或空白
    let out = out
        .trim_end_matches(|c: char| c == '.' || c.is_whitespace())
        .to_string();

    if out.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        out
    }
}

/// 地址的最后一段（已解码），没有时返回 None
fn last_segment(uri: &str) -> Option<String> {
    let raw = if uri.starts_with('/') {
        Path::new(uri).file_name()?.to_string_lossy().into_owned()
    } else {
        let url = Url::parse(uri).ok()?;
        url.path_segments()?.last()?.to_string()
    };
    let decoded = urlencoding::decode(&raw)
        .map(|s| s.into_owned())
        .unwrap_or(raw);
    Some(decoded)
}

/// 按优先级选出清洗后的文件名
pub fn derive_filename(wish: &Wish) -> String {
    let candidates = [
        wish.filename.clone(),
        last_segment(&wish.uri),
        wish.title.clone(),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(|c| sanitize(&c))
        .find(|c| c != FALLBACK_NAME)
        .unwrap_or_else(|| FALLBACK_NAME.to_string())
}

/// MIME 对应的常见扩展名
pub fn extension_for_mime(mime: &str) -> Option<&'static str> {
    let essence = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "text/html" => "html",
        "text/plain" => "txt",
        "text/css" => "css",
        "text/csv" => "csv",
        "application/json" => "json",
        "application/xml" | "text/xml" => "xml",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "application/gzip" => "gz",
        "application/x-7z-compressed" => "7z",
        "application/epub+zip" => "epub",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/aac" => "aac",
        "audio/flac" => "flac",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "video/x-matroska" => "mkv",
        "video/mp2t" => "ts",
        _ => return None,
    };
    Some(ext)
}

pub fn has_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|e| !e.is_empty())
}

/// 没有扩展名时按 MIME 补上
pub fn ensure_extension(name: &str, mime: Option<&str>) -> String {
    if has_extension(name) {
        return name.to_string();
    }
    match mime.and_then(extension_for_mime) {
        Some(ext) => format!("{}.{}", name, ext),
        None => name.to_string(),
    }
}

/// 重名解决策略
pub trait CollisionResolver: Send + Sync {
    /// 返回一个未被占用的路径；无法解决时返回 None
    fn resolve(&self, candidate: &Path, is_taken: &dyn Fn(&Path) -> bool) -> Option<PathBuf>;
}

/// 追加序号：`a.bin` → `a(1).bin` → `a(2).bin`
#[derive(Debug, Clone)]
pub struct SuffixResolver {
    max_attempts: u32,
}

impl SuffixResolver {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }
}

impl Default for SuffixResolver {
    fn default() -> Self {
        Self::new(9999)
    }
}

impl CollisionResolver for SuffixResolver {
    fn resolve(&self, candidate: &Path, is_taken: &dyn Fn(&Path) -> bool) -> Option<PathBuf> {
        if !is_taken(candidate) {
            return Some(candidate.to_path_buf());
        }

        let parent = candidate.parent().unwrap_or_else(|| Path::new(""));
        let stem = candidate.file_stem()?.to_string_lossy().into_owned();
        let ext = candidate
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        (1..=self.max_attempts)
            .map(|n| parent.join(format!("{}({}){}", stem, n, ext)))
            .find(|path| !is_taken(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
        assert_eq!(sanitize("  ..hidden.txt.. "), "hidden.txt");
        assert_eq!(sanitize("tab\there"), "tabhere");
        assert_eq!(sanitize("..."), FALLBACK_NAME);
        assert_eq!(sanitize(""), FALLBACK_NAME);
        assert_eq!(sanitize("中文 文件.pdf"), "中文 文件.pdf");
    }

    #[test]
    fn test_derive_filename_priority() {
        let wish = Wish::new("https://host/dir/a%20b.bin").with_title("Title");
        assert_eq!(derive_filename(&wish), "a b.bin");

        let wish = Wish::new("https://host/dir/a.bin").with_filename("explicit.iso");
        assert_eq!(derive_filename(&wish), "explicit.iso");

        let wish = Wish::new("https://host/").with_title("My: Video");
        assert_eq!(derive_filename(&wish), "My Video");

        let wish = Wish::new("https://host/");
        assert_eq!(derive_filename(&wish), FALLBACK_NAME);

        let wish = Wish::new("/tmp/local file.txt");
        assert_eq!(derive_filename(&wish), "local file.txt");
    }

    #[test]
    fn test_ensure_extension() {
        assert_eq!(ensure_extension("page", Some("text/html; charset=utf-8")), "page.html");
        assert_eq!(ensure_extension("a.bin", Some("text/html")), "a.bin");
        assert_eq!(ensure_extension("blob", Some("application/octet-stream")), "blob");
        assert_eq!(ensure_extension("blob", None), "blob");
    }

    #[test]
    fn test_suffix_resolver() {
        let taken: HashSet<PathBuf> = ["/d/a.bin", "/d/a(1).bin"].iter().map(PathBuf::from).collect();
        let resolver = SuffixResolver::default();
        let is_taken = |p: &Path| taken.contains(p);

        assert_eq!(
            resolver.resolve(Path::new("/d/a.bin"), &is_taken),
            Some(PathBuf::from("/d/a(2).bin"))
        );
        assert_eq!(
            resolver.resolve(Path::new("/d/b.bin"), &is_taken),
            Some(PathBuf::from("/d/b.bin"))
        );

        let all_taken = |_: &Path| true;
        assert_eq!(SuffixResolver::new(3).resolve(Path::new("/d/a.bin"), &all_taken), None);
    }

    #[test]
    fn test_suffix_without_extension() {
        let is_taken = |p: &Path| p == Path::new("/d/readme");
        assert_eq!(
            SuffixResolver::default().resolve(Path::new("/d/readme"), &is_taken),
            Some(PathBuf::from("/d/readme(1)"))
        );
    }

    proptest! {
        #[test]
        fn prop_sanitized_names_are_safe(name in any::<String>()) {
            let out = sanitize(&name);
            prop_assert!(!out.is_empty());
            prop_assert!(out.len() <= MAX_NAME_BYTES);
            prop_assert!(!out.chars().any(|c| FORBIDDEN.contains(&c) || c.is_control()));
            prop_assert!(!out.starts_with('.') && !out.ends_with('.'));
            prop_assert!(!out.starts_with(char::is_whitespace) && !out.ends_with(char::is_whitespace));
        }

        #[test]
        fn prop_sanitize_is_idempotent(name in any::<String>()) {
            let once = sanitize(&name);
            prop_assert_eq!(sanitize(&once), once);
        }
    }
}

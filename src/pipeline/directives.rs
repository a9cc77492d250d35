use crate::util::collapse_blank_runs;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// One `[[SEND_FILE: <path> | <caption>]]` marker lifted out of an engine
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDirective {
    pub path: String,
    pub caption: Option<String>,
}

fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\[SEND_FILE:\s*([^|\]]+?)\s*(?:\|\s*([^\]]*?)\s*)?\]\]")
            .expect("valid directive pattern")
    })
}

/// Splits a response into displayable text and its file directives. Markers
/// are removed from the text and the whitespace they leave behind is
/// collapsed.
pub fn extract_directives(text: &str) -> (String, Vec<FileDirective>) {
    let mut directives = Vec::new();
    for caps in directive_re().captures_iter(text) {
        let path = caps[1].trim().to_string();
        if path.is_empty() {
            continue;
        }
        let caption = caps
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .filter(|c| !c.is_empty());
        directives.push(FileDirective { path, caption });
    }

    let stripped = directive_re().replace_all(text, "");
    let display = stripped
        .lines()
        .map(|line| {
            line.split(' ')
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n");
    let display = collapse_blank_runs(&display).trim().to_string();

    (display, directives)
}

/// Validates an outbound file path. Files must live inside the project root
/// or inside the designated temp directory, exist, be regular files, and
/// stay under the size cap. Returns a short user-facing warning on
/// rejection.
pub fn resolve_outbound_path(
    raw: &str,
    project_root: &Path,
    temp_dir: &Path,
    size_cap_bytes: u64,
) -> Result<PathBuf, String> {
    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        project_root.join(raw)
    };

    let resolved = match candidate.canonicalize() {
        Ok(p) => p,
        Err(_) => return Err(format!("⚠️ File not found: {raw}")),
    };

    let allowed = [project_root, temp_dir]
        .iter()
        .filter_map(|root| root.canonicalize().ok())
        .any(|root| resolved.starts_with(&root));
    if !allowed {
        return Err(format!("⚠️ Refusing to send file outside the project directory: {raw}"));
    }

    let meta = match std::fs::metadata(&resolved) {
        Ok(m) => m,
        Err(_) => return Err(format!("⚠️ File not found: {raw}")),
    };
    if !meta.is_file() {
        return Err(format!("⚠️ Not a regular file: {raw}"));
    }
    if meta.len() > size_cap_bytes {
        return Err(format!(
            "⚠️ File too large to send ({} bytes, cap {} bytes): {raw}",
            meta.len(),
            size_cap_bytes
        ));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn extracts_path_and_caption() {
        let (display, directives) =
            extract_directives("Hello [[SEND_FILE: workspace/temp/report.pdf | Report]] World");

        assert_eq!(display, "Hello World");
        assert_eq!(
            directives,
            vec![FileDirective {
                path: "workspace/temp/report.pdf".into(),
                caption: Some("Report".into()),
            }]
        );
    }

    #[test]
    fn caption_is_optional() {
        let (display, directives) = extract_directives("Done. [[SEND_FILE: out.csv]]");
        assert_eq!(display, "Done.");
        assert_eq!(directives[0].path, "out.csv");
        assert_eq!(directives[0].caption, None);
    }

    #[test]
    fn multiple_directives_and_blank_runs() {
        let text = "First\n\n[[SEND_FILE: a.txt]]\n\n[[SEND_FILE: b.txt | B]]\n\nLast";
        let (display, directives) = extract_directives(text);
        assert_eq!(display, "First\n\nLast");
        assert_eq!(directives.len(), 2);
        assert_eq!(directives[1].caption.as_deref(), Some("B"));
    }

    #[test]
    fn plain_text_passes_through() {
        let (display, directives) = extract_directives("no markers here");
        assert_eq!(display, "no markers here");
        assert!(directives.is_empty());
    }

    #[test]
    fn resolve_accepts_file_under_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("report.txt"), "data").unwrap();

        let resolved =
            resolve_outbound_path("report.txt", root, &root.join("temp"), 1024).unwrap();
        assert!(resolved.ends_with("report.txt"));
    }

    #[test]
    fn resolve_rejects_escape_from_root() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "data").unwrap();

        let err = resolve_outbound_path(
            outside.path().join("secret.txt").to_str().unwrap(),
            tmp.path(),
            &tmp.path().join("temp"),
            1024,
        )
        .unwrap_err();
        assert!(err.contains("outside the project directory"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("workspace");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(tmp.path().join("outside.txt"), "data").unwrap();

        let err = resolve_outbound_path("../outside.txt", &root, &root.join("temp"), 1024)
            .unwrap_err();
        assert!(err.contains("outside the project directory"));
    }

    #[test]
    fn resolve_rejects_missing_and_oversized() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();

        let missing = resolve_outbound_path("nope.txt", root, &root.join("temp"), 1024);
        assert!(missing.unwrap_err().contains("not found"));

        std::fs::write(root.join("big.bin"), vec![0u8; 2048]).unwrap();
        let too_big = resolve_outbound_path("big.bin", root, &root.join("temp"), 1024);
        assert!(too_big.unwrap_err().contains("too large"));
    }

    #[test]
    fn resolve_rejects_directory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("subdir")).unwrap();

        let err = resolve_outbound_path("subdir", root, &root.join("temp"), 1024).unwrap_err();
        assert!(err.contains("Not a regular file"));
    }
}

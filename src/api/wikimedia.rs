use super::{ResolvedMedia, json_size};
use reqwest::Url;
use serde_json::Value;

const COMMONS_API: &str = "https://commons.wikimedia.org/w/api.php";

/// Commons titles always live in the `File:` namespace.
pub fn file_title(name: &str) -> String {
    let name = name.trim();
    let bare = name
        .strip_prefix("File:")
        .or_else(|| name.strip_prefix("file:"))
        .unwrap_or(name);
    format!("File:{}", bare.replace(' ', "_"))
}

pub fn imageinfo_url(name: &str) -> Result<Url, String> {
    let title = file_title(name);
    Url::parse_with_params(
        COMMONS_API,
        &[
            ("action", "query"),
            ("format", "json"),
            ("prop", "imageinfo"),
            ("iiprop", "url|size|mime"),
            ("titles", title.as_str()),
        ],
    )
    .map_err(|e| e.to_string())
}

/// Pull url + size out of a `prop=imageinfo` query response.
pub fn parse_imageinfo(doc: &Value) -> Option<ResolvedMedia> {
    let pages = doc.get("query")?.get("pages")?.as_object()?;
    pages.values().find_map(|page| {
        if page.get("missing").is_some() {
            return None;
        }
        let info = page.get("imageinfo")?.as_array()?.first()?;
        let url = info.get("url")?.as_str()?;
        Some(ResolvedMedia::new(url, json_size(info.get("size"))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn titles_are_namespaced() {
        assert_eq!(file_title("Battle of Verdun.webm"), "File:Battle_of_Verdun.webm");
        assert_eq!(file_title("File:Map.png"), "File:Map.png");
        let url = imageinfo_url("Map.png").unwrap();
        assert!(url.as_str().contains("titles=File%3AMap.png"));
    }

    #[test]
    fn parses_imageinfo() {
        let doc = json!({"query": {"pages": {"4711": {
            "title": "File:Map.png",
            "imageinfo": [{"url": "https://upload.wikimedia.org/a/ab/Map.png", "size": 90210, "mime": "image/png"}]
        }}}});
        let media = parse_imageinfo(&doc).unwrap();
        assert_eq!(media.url, "https://upload.wikimedia.org/a/ab/Map.png");
        assert_eq!(media.reported_size, Some(90210));
    }

    #[test]
    fn missing_page_yields_none() {
        let doc = json!({"query": {"pages": {"-1": {"title": "File:Nope.png", "missing": ""}}}});
        assert!(parse_imageinfo(&doc).is_none());
    }
}

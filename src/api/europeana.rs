use reqwest::Url;
use serde_json::Value;

pub const DEMO_KEY: &str = "api2demo";

const RECORD_BASE: &str = "https://api.europeana.eu/record/v2";

pub fn record_url(record_id: &str, api_key: &str) -> Result<Url, String> {
    let id = record_id.trim().trim_matches('/');
    if id.is_empty() {
        return Err("empty record id".to_string());
    }
    Url::parse_with_params(&format!("{}/{}.json", RECORD_BASE, id), &[("wskey", api_key)])
        .map_err(|e| e.to_string())
}

/// `edmIsShownBy` (the media itself) wins over `edmIsShownAt` (landing page).
pub fn parse_record(doc: &Value) -> Option<String> {
    let aggregations = doc.get("object")?.get("aggregations")?.as_array()?;
    for key in ["edmIsShownBy", "edmIsShownAt"] {
        let found = aggregations
            .iter()
            .filter_map(|agg| agg.get(key).and_then(Value::as_str))
            .map(str::trim)
            .find(|url| !url.is_empty());
        if let Some(url) = found {
            return Some(url.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_url_strips_slashes() {
        let url = record_url("/2021672/resource_1/", DEMO_KEY).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.europeana.eu/record/v2/2021672/resource_1.json?wskey=api2demo"
        );
        assert!(record_url(" / ", DEMO_KEY).is_err());
    }

    #[test]
    fn shown_by_preferred() {
        let doc = json!({"object": {"aggregations": [
            {"edmIsShownAt": "https://museum.example/page", "edmIsShownBy": "https://museum.example/film.mp4"}
        ]}});
        assert_eq!(parse_record(&doc).as_deref(), Some("https://museum.example/film.mp4"));

        let doc = json!({"object": {"aggregations": [{"edmIsShownAt": "https://museum.example/page"}]}});
        assert_eq!(parse_record(&doc).as_deref(), Some("https://museum.example/page"));
        assert!(parse_record(&json!({"object": {}})).is_none());
    }
}

//! Initial titles for the crawl frontier.

use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::crawler::TitleQuery;
use crate::{Error, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedEntry {
    Name(String),
    Record { wiki_title: String },
}

/// Reads seed titles from `path`, in file order.
///
/// A file whose first non-blank character is `[` is a JSON array of
/// strings or of `{"wiki_title": ...}` objects; anything else is one title
/// per line. Blank entries are skipped.
pub async fn load_seeds(path: impl AsRef<Path>) -> Result<Vec<TitleQuery>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await?;
    let seeds = parse_seeds(&content)
        .map_err(|e| Error::Config(format!("Invalid seed file {:?}: {}", path, e)))?;

    info!(path = ?path, count = seeds.len(), "Loaded seed titles");
    Ok(seeds)
}

pub fn parse_seeds(content: &str) -> std::result::Result<Vec<TitleQuery>, serde_json::Error> {
    let titles: Vec<String> = if content.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<SeedEntry>>(content)?
            .into_iter()
            .map(|entry| match entry {
                SeedEntry::Name(name) => name,
                SeedEntry::Record { wiki_title } => wiki_title,
            })
            .collect()
    } else {
        content.lines().map(str::to_string).collect()
    };

    Ok(titles
        .into_iter()
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .map(TitleQuery::new)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(seeds: &[TitleQuery]) -> Vec<&str> {
        seeds.iter().map(|seed| seed.title.as_str()).collect()
    }

    #[test]
    fn test_line_delimited() {
        let seeds = parse_seeds("Hà Nội\n\n  Huế  \r\nĐà Nẵng\n").unwrap();
        assert_eq!(names(&seeds), vec!["Hà Nội", "Huế", "Đà Nẵng"]);
        assert!(seeds.iter().all(|seed| seed.id.is_none()));
    }

    #[test]
    fn test_json_array_of_mixed_entries() {
        let seeds = parse_seeds(r#"[ "Việt Nam", {"wiki_title": "Sài Gòn"}, "" ]"#).unwrap();
        assert_eq!(names(&seeds), vec!["Việt Nam", "Sài Gòn"]);
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(parse_seeds(r#"[ {"title": "x"} ]"#).is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("seeds.txt");
        tokio::fs::write(&path, "Hội An\nCần Thơ\n").await.unwrap();

        let seeds = load_seeds(&path).await.unwrap();
        assert_eq!(names(&seeds), vec!["Hội An", "Cần Thơ"]);

        let missing = load_seeds(dir.path().join("absent.txt")).await.unwrap_err();
        assert!(matches!(missing, Error::Io(_)));
    }
}

//! `KEY=VALUE` 줄 단위 설정 문서
//!
//! 키는 문서 내에서 유일하며, 같은 키를 다시 쓰면 기존 줄을 제자리에서 교체한다.
//! `=`이 없는 줄이나 알 수 없는 키는 병합 후에도 그대로 보존된다.

use std::fmt;

/// 설정 문서 (config.env, remote-config.env)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    lines: Vec<String>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// 텍스트 파싱. 중복 키는 첫 위치에 마지막 값으로 합쳐진다
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::new();
        for raw in text.lines() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            match split_entry(line) {
                Some((key, value)) => doc.set(key, value),
                None => doc.lines.push(line.to_string()),
            }
        }
        doc
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .filter_map(|l| split_entry(l))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// 같은 키의 줄이 있으면 교체, 없으면 끝에 추가
    pub fn set(&mut self, key: &str, value: &str) {
        let line = format!("{}={}", key, value);
        match self
            .lines
            .iter()
            .position(|l| split_entry(l).map(|(k, _)| k == key).unwrap_or(false))
        {
            Some(idx) => self.lines[idx] = line,
            None => self.lines.push(line),
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.lines.len();
        self.lines
            .retain(|l| split_entry(l).map(|(k, _)| k != key).unwrap_or(true));
        before != self.lines.len()
    }

    /// 원격 `KEY=VALUE` 항목들을 병합. 형식이 맞지 않는 항목은 무시하고 개수를 반환
    pub fn merge_entries<I, S>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut merged = 0;
        for entry in entries {
            if let Some((key, value)) = split_entry(entry.as_ref()) {
                self.set(key, value);
                merged += 1;
            }
        }
        merged
    }

    pub fn to_text(&self) -> String {
        self.lines.join("\n")
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// `KEY=VALUE` 분리. 값에 `=`이 포함될 수 있으므로 첫 번째 `=` 기준
pub fn split_entry(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        None
    } else {
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_in_place() {
        let mut doc = ConfigDocument::parse("A=1\nB=2\nC=3");
        doc.set("B", "20");
        assert_eq!(doc.to_text(), "A=1\nB=20\nC=3");
    }

    #[test]
    fn set_appends_unknown_key() {
        let mut doc = ConfigDocument::parse("A=1");
        doc.set("TIME_CREATED", "2026-01-01T00:00:00Z");
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.get("TIME_CREATED"), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn key_match_is_exact_not_prefix() {
        let mut doc = ConfigDocument::parse("PORT=80\nPORT_ALT=8080");
        doc.set("PORT", "81");
        assert_eq!(doc.get("PORT_ALT"), Some("8080"));
        assert_eq!(doc.get("PORT"), Some("81"));
    }

    #[test]
    fn duplicate_keys_last_write_wins() {
        let doc = ConfigDocument::parse("A=1\nB=2\nA=3");
        assert_eq!(doc.to_text(), "A=3\nB=2");
    }

    #[test]
    fn merge_preserves_unknown_lines() {
        let mut doc = ConfigDocument::parse("# comment\nLOCAL_ONLY=yes\nSHARED=old");
        let merged = doc.merge_entries(["SHARED=new", "REMOTE_ONLY=1", "garbage"]);
        assert_eq!(merged, 2);
        assert_eq!(
            doc.to_text(),
            "# comment\nLOCAL_ONLY=yes\nSHARED=new\nREMOTE_ONLY=1"
        );
    }

    #[test]
    fn values_may_contain_equals() {
        let doc = ConfigDocument::parse("refresh_token=abc==");
        assert_eq!(doc.get("refresh_token"), Some("abc=="));
    }

    #[test]
    fn crlf_and_blank_lines() {
        let doc = ConfigDocument::parse("A=1\r\n\r\nB=2\r\n");
        assert_eq!(doc.lines(), &["A=1".to_string(), "B=2".to_string()]);
    }
}

//! 시맨틱 버전 비교 유틸리티
//!
//! frida 릴리스 태그(`16.1.0`)와 설치 마커 파일의 내용 모두 이 타입으로 파싱한다.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// 시맨틱 버전 (major.minor.patch[-prerelease])
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

impl SemVer {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch, prerelease: None }
    }

    /// "v1.2.3", "1.2.3", "1.2.3-beta.1" 형식을 파싱. 빌드 메타데이터(`+...`)는 무시.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        let s = s.split('+').next().unwrap_or(s);
        let (version_part, prerelease) = match s.find('-') {
            Some(idx) => (&s[..idx], Some(s[idx + 1..].to_string())),
            None => (s, None),
        };
        if prerelease.as_deref() == Some("") {
            return None;
        }

        let parts: Vec<&str> = version_part.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return None;
        }

        let major = parts[0].parse().ok()?;
        let minor = parts[1].parse().ok()?;
        let patch = match parts.get(2) {
            Some(p) => p.parse().ok()?,
            None => 0,
        };

        Some(Self { major, minor, patch, prerelease })
    }

    /// 엄격한 비교: 같은 버전이면 false
    pub fn is_newer_than(&self, other: &SemVer) -> bool {
        self > other
    }

    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.prerelease {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl FromStr for SemVer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid version '{}'", s))
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // 프리릴리스는 정식 릴리스보다 낮음
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => compare_prerelease(a, b),
            })
    }
}

/// 점으로 나눈 식별자별 비교: 숫자는 숫자로, 숫자 < 문자, 짧은 쪽이 낮음
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        let ord = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match (x.parse::<u64>(), y.parse::<u64>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => x.cmp(y),
            },
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for SemVer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemVer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frida_tag() {
        let v = SemVer::parse("16.1.0").unwrap();
        assert_eq!(v, SemVer::new(16, 1, 0));
        assert!(v.prerelease.is_none());
    }

    #[test]
    fn parse_with_v_prefix_and_whitespace() {
        let v = SemVer::parse(" v0.1.0\n").unwrap();
        assert_eq!(v.major, 0);
        assert_eq!(v.minor, 1);
    }

    #[test]
    fn parse_prerelease() {
        let v = SemVer::parse("1.0.0-beta.1").unwrap();
        assert!(v.is_prerelease());
        assert_eq!(v.prerelease, Some("beta.1".to_string()));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(SemVer::parse("").is_none());
        assert!(SemVer::parse("16").is_none());
        assert!(SemVer::parse("16.x.0").is_none());
        assert!(SemVer::parse("1.2.3.4").is_none());
        assert!(SemVer::parse("1.2.3-").is_none());
    }

    #[test]
    fn equal_versions_are_not_newer() {
        let a = SemVer::parse("16.1.0").unwrap();
        let b = SemVer::parse("v16.1.0").unwrap();
        assert!(!a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
    }

    #[test]
    fn compare_versions() {
        let v1 = SemVer::parse("16.0.19").unwrap();
        let v2 = SemVer::parse("16.1.0").unwrap();
        assert!(v2.is_newer_than(&v1));
        assert!(SemVer::parse("17.0.0").unwrap().is_newer_than(&v2));
    }

    #[test]
    fn prerelease_less_than_release() {
        let pre = SemVer::parse("1.0.0-beta.1").unwrap();
        let rel = SemVer::parse("1.0.0").unwrap();
        assert!(rel.is_newer_than(&pre));
    }

    #[test]
    fn prerelease_identifiers_compare_numerically() {
        let v = |s: &str| SemVer::parse(s).unwrap();
        assert!(v("16.0.0-rc.10").is_newer_than(&v("16.0.0-rc.9")));
        assert!(!v("16.0.0-rc.9").is_newer_than(&v("16.0.0-rc.10")));
        // 숫자 식별자 < 문자 식별자, 짧은 쪽이 낮음
        assert!(v("1.0.0-alpha.beta").is_newer_than(&v("1.0.0-alpha.1")));
        assert!(v("1.0.0-alpha.1").is_newer_than(&v("1.0.0-alpha")));
        assert!(v("1.0.0-beta").is_newer_than(&v("1.0.0-alpha.beta")));
        assert_eq!(v("1.0.0-rc.1").cmp(&v("1.0.0-rc.1")), Ordering::Equal);
    }

    #[test]
    fn serde_as_string() {
        let v = SemVer::parse("16.1.0").unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"16.1.0\"");
        let back: SemVer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}

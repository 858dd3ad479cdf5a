//! Release link parsing
//!
//! Extracts anchors from simple index pages, turns them into [`Link`]s and
//! keeps the best candidate per basename. Also parses the full project
//! listing page and splits release file basenames.

use pkgindex_common::normalize_name;
use regex::Regex;
use reqwest::Url;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;
use tracing::{debug, warn};

static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<a\s([^>]*)>").expect("valid anchor regex"));

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .expect("valid attribute regex")
});

static SDIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)-(\d.*)$").expect("valid sdist regex"));

/// Hash algorithms accepted in `#<algo>=<hex>` fragments
pub const HASH_TYPES: &[&str] = &["md5", "sha1", "sha224", "sha256", "sha384", "sha512"];

/// Release file extensions, longest match first
pub const ARCHIVE_EXTENSIONS: &[&str] = &[
    ".tar.gz", ".tar.bz2", ".tar.xz", ".tgz", ".tbz", ".zip", ".whl", ".egg", ".tar", ".exe",
];

/// One `<a>` tag of a page
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Anchor {
    pub href: String,
    pub requires_python: Option<String>,
    pub yanked: Option<String>,
}

/// Extract all anchors carrying an `href`
#[must_use]
pub fn parse_anchors(html: &str) -> Vec<Anchor> {
    let mut anchors = Vec::new();
    for tag in ANCHOR_RE.captures_iter(html) {
        let mut anchor = Anchor::default();
        let mut has_href = false;
        for attr in ATTR_RE.captures_iter(&tag[1]) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map(|m| html_unescape(m.as_str()));
            match attr[1].to_ascii_lowercase().as_str() {
                "href" => {
                    if let Some(href) = value {
                        anchor.href = href;
                        has_href = true;
                    }
                }
                "data-requires-python" => anchor.requires_python = value,
                // a bare data-yanked marks the link yanked without a reason
                "data-yanked" => anchor.yanked = Some(value.unwrap_or_default()),
                _ => {}
            }
        }
        if has_href {
            anchors.push(anchor);
        }
    }
    anchors
}

/// Decode the character references appearing in attribute values
#[must_use]
pub fn html_unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let decoded = rest.find(';').and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity.strip_prefix('#').and_then(|num| {
                    let code = match num.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => num.parse().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// A release file link
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    /// Link URL without fragment
    pub url: Url,
    pub basename: String,
    /// `<algo>=<hexdigest>` from the fragment
    pub hash_spec: Option<String>,
    pub requires_python: Option<String>,
    pub yanked: Option<String>,
}

impl Link {
    /// Build a link, moving a valid hash fragment into `hash_spec`
    #[must_use]
    pub fn new(mut url: Url, requires_python: Option<String>, yanked: Option<String>) -> Self {
        let hash_spec = url.fragment().filter(|f| is_hash_spec(f)).map(str::to_string);
        url.set_fragment(None);
        let basename = url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .unwrap_or_default()
            .to_string();
        Self {
            url,
            basename,
            hash_spec,
            requires_python,
            yanked,
        }
    }

    /// Hex digest of `hash_spec`
    #[must_use]
    pub fn hash_value(&self) -> Option<&str> {
        self.hash_spec.as_deref().and_then(|h| h.split_once('=')).map(|(_, v)| v)
    }

    /// Check if the URL uses http(s)
    #[must_use]
    pub fn is_valid_http_url(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https") && self.url.host().is_some()
    }
}

fn is_hash_spec(fragment: &str) -> bool {
    fragment.split_once('=').is_some_and(|(algo, digest)| {
        HASH_TYPES.contains(&algo)
            && !digest.is_empty()
            && digest.chars().all(|c| c.is_ascii_hexdigit())
    })
}

/// Link attributes considered when two links share a basename, in
/// priority order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkAttribute {
    HashSpec,
    RequiresPython,
}

impl LinkAttribute {
    fn present(self, link: &Link) -> bool {
        match self {
            Self::HashSpec => link.hash_spec.is_some(),
            Self::RequiresPython => link.requires_python.is_some(),
        }
    }
}

pub const MERGE_PRIORITY: &[LinkAttribute] =
    &[LinkAttribute::HashSpec, LinkAttribute::RequiresPython];

/// A candidate replaces the current link while the current one lacks the
/// top-priority attribute and the candidate has a better attribute set.
fn is_better(candidate: &Link, current: &Link) -> bool {
    let Some(top) = MERGE_PRIORITY.first() else {
        return false;
    };
    if top.present(current) {
        return false;
    }
    let presence = |link: &Link| -> Vec<bool> {
        MERGE_PRIORITY.iter().map(|attr| attr.present(link)).collect()
    };
    presence(candidate) > presence(current)
}

/// Release links of `project` found on a simple page, one per basename
#[must_use]
pub fn parse_index(base_url: &Url, html: &str, project: &str) -> Vec<Link> {
    let project = normalize_name(project);
    let mut links: Vec<Link> = Vec::new();
    let mut by_basename: HashMap<String, usize> = HashMap::new();
    for anchor in parse_anchors(html) {
        let Ok(url) = base_url.join(&anchor.href) else {
            warn!("unparsable url: {:?}", anchor.href);
            continue;
        };
        let link = Link::new(url, anchor.requires_python, anchor.yanked);
        if !link.is_valid_http_url() || !is_archive_of_project(&link.basename, &project) {
            continue;
        }
        match by_basename.get(&link.basename) {
            Some(&idx) if is_better(&link, &links[idx]) => {
                debug!("indexparser: replacing link {}", link.url);
                links[idx] = link;
            }
            Some(_) => debug!("indexparser: ignoring candidate link {}", link.url),
            None => {
                by_basename.insert(link.basename.clone(), links.len());
                links.push(link);
            }
        }
    }
    links
}

/// Names on the full project listing page, normalized.
///
/// Relative hrefs contribute their last path segment. Absolute URLs must
/// stay on the host and below the path of `base_url`.
#[must_use]
pub fn parse_project_list(base_url: &Url, html: &str) -> BTreeSet<String> {
    let mut projects = BTreeSet::new();
    for anchor in parse_anchors(html) {
        let href = anchor.href;
        let name = if href.contains("://") {
            let Ok(url) = base_url.join(&href) else {
                continue;
            };
            if !matches!(url.scheme(), "http" | "https")
                || url.scheme() != base_url.scheme()
                || url.host_str() != base_url.host_str()
                || url.port_or_known_default() != base_url.port_or_known_default()
                || !url.path().starts_with(base_url.path().trim_end_matches('/'))
            {
                continue;
            }
            last_segment(url.path()).to_string()
        } else {
            last_segment(&href).to_string()
        };
        if !name.is_empty() {
            projects.insert(normalize_name(&name));
        }
    }
    projects
}

fn last_segment(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// Parts of a release file basename
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasenameParts {
    pub name: String,
    pub version: String,
    pub ext: String,
}

/// Split `six-1.16.0.tar.gz` into `("six", "1.16.0", ".tar.gz")`
#[must_use]
pub fn split_basename(basename: &str) -> Option<BasenameParts> {
    let lower = basename.to_ascii_lowercase();
    let ext = ARCHIVE_EXTENSIONS.iter().find(|ext| lower.ends_with(*ext))?;
    let stem = &basename[..basename.len() - ext.len()];
    let (name, version) = if matches!(*ext, ".whl" | ".egg") {
        let mut parts = stem.split('-');
        (parts.next()?, parts.next()?)
    } else {
        let caps = SDIST_RE.captures(stem)?;
        let name = caps.get(1)?.as_str();
        let version = caps.get(2)?.as_str();
        (name, version)
    };
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some(BasenameParts {
        name: name.to_string(),
        version: version.to_string(),
        ext: (*ext).to_string(),
    })
}

/// Check if `basename` is a release file of `project`
#[must_use]
pub fn is_archive_of_project(basename: &str, project: &str) -> bool {
    split_basename(basename)
        .is_some_and(|parts| normalize_name(&parts.name) == normalize_name(project))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "3a5a3d4a4e6f1b5c8d7e9f0a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e";

    fn base() -> Url {
        Url::parse("https://pypi.org/simple/six/").unwrap()
    }

    #[test]
    fn test_parse_anchors_attributes() {
        let html = r#"<html><body>
            <a href="../../p/six-1.0.tar.gz#sha256=abc" data-requires-python="&gt;=3.8">six-1.0.tar.gz</a>
            <A HREF='six-0.9.zip' data-yanked>six-0.9.zip</A>
            <a name="nohref">x</a>
        </body></html>"#;
        let anchors = parse_anchors(html);
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].requires_python.as_deref(), Some(">=3.8"));
        assert_eq!(anchors[0].yanked, None);
        assert_eq!(anchors[1].href, "six-0.9.zip");
        assert_eq!(anchors[1].yanked.as_deref(), Some(""));
    }

    #[test]
    fn test_html_unescape() {
        assert_eq!(html_unescape("&gt;=3.6, &lt;4"), ">=3.6, <4");
        assert_eq!(html_unescape("a&#33;b&#x21;"), "a!b!");
        assert_eq!(html_unescape("fish & chips"), "fish & chips");
    }

    #[test]
    fn test_link_hash_fragment() {
        let url = base().join(&format!("six-1.0.tar.gz#sha256={HASH}")).unwrap();
        let link = Link::new(url, None, None);
        assert_eq!(link.basename, "six-1.0.tar.gz");
        assert_eq!(link.hash_spec.as_deref(), Some(format!("sha256={HASH}").as_str()));
        assert_eq!(link.hash_value(), Some(HASH));
        assert!(link.url.fragment().is_none());

        let other = Link::new(base().join("six-1.0.tar.gz#egg=six").unwrap(), None, None);
        assert!(other.hash_spec.is_none());
    }

    #[test]
    fn test_parse_index_filters_and_resolves() {
        let html = format!(
            r#"<a href="../../packages/six-1.0.tar.gz#sha256={HASH}">six-1.0.tar.gz</a>
               <a href="https://files.example/six-1.1-py3-none-any.whl">whl</a>
               <a href="../../packages/other-1.0.tar.gz">other</a>
               <a href="ftp://files.example/six-0.1.zip">ftp</a>"#
        );
        let links = parse_index(&base(), &html, "Six");
        let basenames: Vec<_> = links.iter().map(|l| l.basename.as_str()).collect();
        assert_eq!(basenames, vec!["six-1.0.tar.gz", "six-1.1-py3-none-any.whl"]);
        assert_eq!(links[0].url.as_str(), "https://pypi.org/packages/six-1.0.tar.gz");
    }

    #[test]
    fn test_merge_prefers_hash_then_requires_python() {
        let html = format!(
            r#"<a href="a/six-1.0.zip">plain</a>
               <a href="b/six-1.0.zip" data-requires-python="&gt;=3">rp</a>
               <a href="c/six-1.0.zip#sha256={HASH}">hash</a>
               <a href="d/six-1.0.zip#sha256={HASH}" data-requires-python="&gt;=3">late</a>"#
        );
        let links = parse_index(&base(), &html, "six");
        assert_eq!(links.len(), 1);
        assert!(links[0].url.path().contains("/c/"));
        assert!(links[0].requires_python.is_none());

        let html = r#"<a href="a/six-1.0.zip">plain</a>
                      <a href="b/six-1.0.zip" data-requires-python="&gt;=3">rp</a>"#;
        let links = parse_index(&base(), html, "six");
        assert_eq!(links[0].requires_python.as_deref(), Some(">=3"));
    }

    #[test]
    fn test_parse_project_list() {
        let base = Url::parse("https://pypi.org/simple/").unwrap();
        let html = r#"<a href="/simple/Django/">Django</a>
            <a href="zope.interface/">zope.interface</a>
            <a href="https://pypi.org/simple/requests/">requests</a>
            <a href="https://evil.example/simple/bad/">bad</a>
            <a href="https://pypi.org/other/outside/">outside</a>"#;
        let projects = parse_project_list(&base, html);
        let expected: BTreeSet<String> = ["django", "zope-interface", "requests"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(projects, expected);
    }

    #[test]
    fn test_split_basename() {
        let parts = split_basename("python_dateutil-2.8.2.tar.gz").unwrap();
        assert_eq!(
            (parts.name.as_str(), parts.version.as_str(), parts.ext.as_str()),
            ("python_dateutil", "2.8.2", ".tar.gz")
        );
        let wheel = split_basename("six-1.16.0-py2.py3-none-any.whl").unwrap();
        assert_eq!(wheel.version, "1.16.0");
        let dashed = split_basename("zope-interface-5.0.zip").unwrap();
        assert_eq!(dashed.name, "zope-interface");
        assert!(split_basename("README.txt").is_none());
        assert!(split_basename("noversion.tar.gz").is_none());
    }

    #[test]
    fn test_is_archive_of_project() {
        assert!(is_archive_of_project("Python_Dateutil-2.8.2.tar.gz", "python-dateutil"));
        assert!(!is_archive_of_project("six-1.0.tar.gz", "sixer"));
    }
}

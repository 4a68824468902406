//! Content rewriting for intercepted pages and scripts.
//!
//! Two kinds of rewriting happen here:
//!
//! - **Cache busting.** Script references in pages and import specifiers in
//!   scripts gain a `?t=<version>` suffix so the client fetches fresh copies
//!   through the proxy instead of serving stale cached ones. The patterns
//!   anchor on a closing `.js"`, so a reference that already carries a suffix
//!   is never matched again and the rewrite is idempotent.
//! - **Targeted patches.** A fixed set of [`PatchRule`]s splice fragments into
//!   known minified code shapes of the player and feed-detail scripts, and the
//!   bootstrap payload is injected into the feed/home pages. Each rule reports
//!   a [`PatchOutcome`]; a miss leaves the content as it was.

use regex::{NoExpand, Regex};

/// Version appended to rewritten script references.
pub const ASSET_VERSION: &str = "250215";

/// Pages that receive the bootstrap script.
pub const INJECTED_PAGE_PATHS: &[&str] = &["/web/pages/feed", "/web/pages/home"];

/// Path fragment of the player script holding the decrypt loop.
pub const PLAYER_SCRIPT: &str = "/t/wx_fed/finder/web/web-finder/res/js/index.publish";

/// Path fragment of the script issuing feed-detail requests.
pub const FEED_DETAIL_SCRIPT: &str =
    "/t/wx_fed/finder/web/web-finder/res/js/virtual_svg-icons-register";

const BUFFER_CAPTURE: &str = r#"(() => {
if (window.__wx_channels_store__) {
window.__wx_channels_store__.buffers.push(h);
}
})(),this.sourceBuffer.appendBuffer(h),"#;

const KEY_CAPTURE: &str = r#"if(f.cmd==="CUT"){
if (window.__wx_channels_store__) {
console.log("CUT", f, __wx_channels_store__.profile.key);
window.__wx_channels_store__.keys[__wx_channels_store__.profile.key]=f.decryptor_array;
}
}
if(f.cmd===re.MAIN_THREAD_CMD.AUTO_CUT"#;

const PROFILE_EXPORT: &str = r#"async finderGetCommentDetail(${1}) {
var feedResult = await${2};
var data_object = feedResult.data.object;
if (!data_object.objectDesc) {
return feedResult;
}
var media = data_object.objectDesc.media[0];
var profile = media.mediaType !== 4 ? {
type: "picture",
id: data_object.id,
title: data_object.objectDesc.description,
files: data_object.objectDesc.media,
spec: [],
contact: data_object.contact
} : {
type: "media",
duration: media.spec[0].durationMs,
spec: media.spec,
title: data_object.objectDesc.description,
coverUrl: media.coverUrl,
url: media.url + media.urlToken,
size: media.fileSize,
key: media.decodeKey,
id: data_object.id,
nonce_id: data_object.objectNonceId,
nickname: data_object.nickname,
createtime: data_object.createtime,
fileFormat: media.spec.map(o => o.fileFormat),
contact: data_object.contact
};
fetch("/__wx_channels_api/profile", {
method: "POST",
headers: { "Content-Type": "application/json" },
body: JSON.stringify(profile)
});
if (window.__wx_channels_store__) {
__wx_channels_store__.profile = profile;
window.__wx_channels_store__.profiles.push(profile);
}
return feedResult;
}async"#;

/// What happened when a rule ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The pattern matched and was replaced.
    Applied { rule: &'static str, matches: usize },
    /// The pattern was not found; the content is unchanged.
    NotFound { rule: &'static str },
}

impl PatchOutcome {
    pub fn rule(&self) -> &'static str {
        match self {
            Self::Applied { rule, .. } | Self::NotFound { rule } => rule,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// A named regex substitution.
#[derive(Debug, Clone)]
pub struct PatchRule {
    name: &'static str,
    regex: Regex,
    replacement: String,
    /// Expand `${n}` capture references in the replacement.
    expand: bool,
    /// Maximum replacements; 0 replaces every match.
    limit: usize,
}

impl PatchRule {
    /// Creates a rule replacing every match, expanding capture references.
    pub fn new(
        name: &'static str,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            regex: Regex::new(pattern)?,
            replacement: replacement.into(),
            expand: true,
            limit: 0,
        })
    }

    /// Creates a rule whose replacement is inserted verbatim.
    pub fn literal(
        name: &'static str,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            expand: false,
            ..Self::new(name, pattern, replacement)?
        })
    }

    /// Limits the rule to the first `limit` matches.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Applies the rule to `input`.
    pub fn apply(&self, input: &str) -> (String, PatchOutcome) {
        let mut matches = self.regex.find_iter(input).count();
        if matches == 0 {
            return (input.to_string(), PatchOutcome::NotFound { rule: self.name });
        }
        if self.limit > 0 {
            matches = matches.min(self.limit);
        }

        let output = if self.expand {
            self.regex
                .replacen(input, self.limit, self.replacement.as_str())
        } else {
            self.regex
                .replacen(input, self.limit, NoExpand(&self.replacement))
        };

        (
            output.into_owned(),
            PatchOutcome::Applied {
                rule: self.name,
                matches,
            },
        )
    }
}

/// Result of rewriting one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    /// The rewritten content.
    pub body: String,
    /// Number of script references that gained the version suffix.
    pub cache_busted: usize,
    /// Outcomes of the targeted patches that were attempted.
    pub patches: Vec<PatchOutcome>,
}

impl Rewrite {
    fn new(body: String) -> Self {
        Self {
            body,
            cache_busted: 0,
            patches: Vec::new(),
        }
    }

    /// Targeted patches whose pattern was not found.
    pub fn misses(&self) -> impl Iterator<Item = &PatchOutcome> {
        self.patches.iter().filter(|p| !p.is_applied())
    }

    fn bust(&mut self, rule: &PatchRule) {
        if let PatchOutcome::Applied { matches, .. } = self.run(rule) {
            self.cache_busted += matches;
        }
    }

    fn patch(&mut self, rule: &PatchRule) {
        let outcome = self.run(rule);
        self.patches.push(outcome);
    }

    fn run(&mut self, rule: &PatchRule) -> PatchOutcome {
        let (body, outcome) = rule.apply(&self.body);
        self.body = body;
        outcome
    }
}

/// Which targeted patches a script path calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptTarget {
    /// Player script: capture media buffers and decrypt keys.
    Player,
    /// Feed-detail script: export the opened feed as a profile object.
    FeedDetail,
    /// Cache busting only.
    Other,
}

impl ScriptTarget {
    pub fn from_path(path: &str) -> Self {
        if path.contains(PLAYER_SCRIPT) {
            Self::Player
        } else if path.contains(FEED_DETAIL_SCRIPT) {
            Self::FeedDetail
        } else {
            Self::Other
        }
    }
}

/// Rewrites intercepted pages and scripts.
#[derive(Debug, Clone)]
pub struct ContentRewriter {
    version_suffix: String,
    page_rules: Vec<PatchRule>,
    script_rules: Vec<PatchRule>,
    bootstrap: PatchRule,
    player: Vec<PatchRule>,
    feed_detail: PatchRule,
}

impl ContentRewriter {
    /// Creates a rewriter appending `?t=<version>` and injecting `bootstrap`.
    pub fn new(version: &str, bootstrap: &str) -> Result<Self, regex::Error> {
        let suffix = format!("?t={}", version);
        // `$` is the capture marker in replacement templates.
        let s = suffix.replace('$', "$$");

        let page_rules = vec![
            PatchRule::new("html-src", r#"src="([^"]+)\.js""#, format!(r#"src="${{1}}.js{s}""#))?,
            PatchRule::new("html-href", r#"href="([^"]+)\.js""#, format!(r#"href="${{1}}.js{s}""#))?,
        ];

        let script_rules = vec![
            PatchRule::new("js-from", r#"from ?"([^"]+)\.js""#, format!(r#"from"${{1}}.js{s}""#))?,
            PatchRule::new("js-dep", r#""js/([^"]+)\.js""#, format!(r#""js/${{1}}.js{s}""#))?,
            PatchRule::new(
                "js-lazy-import",
                r#"import\("([^"]+)\.js"\)"#,
                format!(r#"import("${{1}}.js{s}")"#),
            )?,
            PatchRule::new("js-import", r#"import ?"([^"]+)\.js""#, format!(r#"import"${{1}}.js{s}""#))?,
        ];

        let bootstrap = PatchRule::literal(
            "bootstrap-inject",
            "<head>",
            format!("<head>\n<script>{}</script>", bootstrap),
        )?
        .with_limit(1);

        let player = vec![
            PatchRule::literal(
                "media-buffer-capture",
                r"this\.sourceBuffer\.appendBuffer\(h\),",
                BUFFER_CAPTURE,
            )?,
            PatchRule::literal(
                "decrypt-key-capture",
                r"if\(f\.cmd===re\.MAIN_THREAD_CMD\.AUTO_CUT",
                KEY_CAPTURE,
            )?,
        ];

        let feed_detail = PatchRule::new(
            "feed-profile-export",
            r"async finderGetCommentDetail\((\w+)\)\{return(.*?)\}async",
            PROFILE_EXPORT,
        )?;

        Ok(Self {
            version_suffix: suffix,
            page_rules,
            script_rules,
            bootstrap,
            player,
            feed_detail,
        })
    }

    /// Creates a rewriter with [`ASSET_VERSION`].
    pub fn with_bootstrap(bootstrap: &str) -> Result<Self, regex::Error> {
        Self::new(ASSET_VERSION, bootstrap)
    }

    /// The `?t=<version>` suffix.
    pub fn version_suffix(&self) -> &str {
        &self.version_suffix
    }

    /// Returns true if `path` is a page that receives the bootstrap script.
    pub fn is_injected_page(path: &str) -> bool {
        INJECTED_PAGE_PATHS.contains(&path)
    }

    /// Rewrites an HTML page. The bootstrap script is injected only when
    /// `inject` is set and `path` is one of [`INJECTED_PAGE_PATHS`].
    pub fn rewrite_page(&self, path: &str, inject: bool, html: &str) -> Rewrite {
        let mut rewrite = Rewrite::new(html.to_string());
        for rule in &self.page_rules {
            rewrite.bust(rule);
        }
        if inject && Self::is_injected_page(path) {
            rewrite.patch(&self.bootstrap);
        }
        rewrite
    }

    /// Rewrites a script body, applying the patches its path calls for.
    pub fn rewrite_script(&self, path: &str, script: &str) -> Rewrite {
        let mut rewrite = Rewrite::new(script.to_string());
        for rule in &self.script_rules {
            rewrite.bust(rule);
        }
        match ScriptTarget::from_path(path) {
            ScriptTarget::Player => {
                for rule in &self.player {
                    rewrite.patch(rule);
                }
            }
            ScriptTarget::FeedDetail => rewrite.patch(&self.feed_detail),
            ScriptTarget::Other => {}
        }
        rewrite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYER_PATH: &str = "/t/wx_fed/finder/web/web-finder/res/js/index.publish.abc.js";
    const FEED_DETAIL_PATH: &str =
        "/t/wx_fed/finder/web/web-finder/res/js/virtual_svg-icons-register.abc.js";

    fn rewriter() -> ContentRewriter {
        ContentRewriter::with_bootstrap("window.__boot=1;$x").unwrap()
    }

    // ==================== PatchRule Tests ====================

    #[test]
    fn rule_reports_not_found() {
        let rule = PatchRule::new("r", "absent", "x").unwrap();
        let (out, outcome) = rule.apply("content");
        assert_eq!(out, "content");
        assert_eq!(outcome, PatchOutcome::NotFound { rule: "r" });
        assert!(!outcome.is_applied());
    }

    #[test]
    fn rule_counts_matches_and_honors_limit() {
        let rule = PatchRule::literal("r", "a", "$b").unwrap().with_limit(1);
        let (out, outcome) = rule.apply("aaa");
        assert_eq!(out, "$baa");
        assert_eq!(outcome, PatchOutcome::Applied { rule: "r", matches: 1 });
    }

    // ==================== Cache-bust Tests ====================

    #[test]
    fn page_script_references_get_suffix() {
        let html = r#"<script src="/a/b.js"></script><link href="c.js"><img src="x.png">"#;
        let rewrite = rewriter().rewrite_page("/web/pages/other", true, html);
        assert_eq!(
            rewrite.body,
            r#"<script src="/a/b.js?t=250215"></script><link href="c.js?t=250215"><img src="x.png">"#
        );
        assert_eq!(rewrite.cache_busted, 2);
        assert!(rewrite.patches.is_empty());
    }

    #[test]
    fn page_rewrite_is_idempotent() {
        let rewriter = rewriter();
        let once = rewriter.rewrite_page("/x", false, r#"<script src="a.js"></script>"#);
        let twice = rewriter.rewrite_page("/x", false, &once.body);
        assert_eq!(once.body, r#"<script src="a.js?t=250215"></script>"#);
        assert_eq!(twice.body, once.body);
        assert_eq!(twice.cache_busted, 0);
    }

    #[test]
    fn script_specifiers_get_suffix() {
        let js = concat!(
            r#"import{a}from "./m.js";"#,
            r#"const d=["js/chunk.js"];"#,
            r#"import("./lazy.js");"#,
            r#"import "./side.js";"#
        );
        let rewrite = rewriter().rewrite_script("/static/app.js", js);
        assert_eq!(
            rewrite.body,
            concat!(
                r#"import{a}from"./m.js?t=250215";"#,
                r#"const d=["js/chunk.js?t=250215"];"#,
                r#"import("./lazy.js?t=250215");"#,
                r#"import"./side.js?t=250215";"#
            )
        );
        assert_eq!(rewrite.cache_busted, 4);

        let again = rewriter().rewrite_script("/static/app.js", &rewrite.body);
        assert_eq!(again.body, rewrite.body);
    }

    #[test]
    fn custom_version_is_used() {
        let rewriter = ContentRewriter::new("1$2", "").unwrap();
        assert_eq!(rewriter.version_suffix(), "?t=1$2");
        let rewrite = rewriter.rewrite_page("/", false, r#"src="a.js""#);
        assert_eq!(rewrite.body, r#"src="a.js?t=1$2""#);
    }

    // ==================== Injection Tests ====================

    #[test]
    fn bootstrap_injected_after_first_head() {
        let html = "<html><head><title>t</title></head><head></head></html>";
        let rewrite = rewriter().rewrite_page("/web/pages/feed", true, html);
        assert_eq!(
            rewrite.body,
            "<html><head>\n<script>window.__boot=1;$x</script><title>t</title></head><head></head></html>"
        );
        assert_eq!(
            rewrite.patches,
            vec![PatchOutcome::Applied { rule: "bootstrap-inject", matches: 1 }]
        );
    }

    #[test]
    fn bootstrap_not_injected_elsewhere() {
        let html = "<head></head>";
        let rewriter = rewriter();
        assert_eq!(rewriter.rewrite_page("/web/pages/profile", true, html).body, html);
        assert_eq!(rewriter.rewrite_page("/web/pages/home", false, html).body, html);
    }

    #[test]
    fn missing_head_is_reported() {
        let rewrite = rewriter().rewrite_page("/web/pages/home", true, "<body></body>");
        assert_eq!(rewrite.body, "<body></body>");
        assert_eq!(rewrite.misses().count(), 1);
    }

    // ==================== Script Patch Tests ====================

    #[test]
    fn script_target_from_path() {
        assert_eq!(ScriptTarget::from_path(PLAYER_PATH), ScriptTarget::Player);
        assert_eq!(ScriptTarget::from_path(FEED_DETAIL_PATH), ScriptTarget::FeedDetail);
        assert_eq!(ScriptTarget::from_path("/other.js"), ScriptTarget::Other);
    }

    #[test]
    fn player_patches_capture_buffers_and_keys() {
        let js = "x(),this.sourceBuffer.appendBuffer(h),y();if(f.cmd===re.MAIN_THREAD_CMD.AUTO_CUT){z()}";
        let rewrite = rewriter().rewrite_script(PLAYER_PATH, js);

        assert!(rewrite
            .body
            .contains("window.__wx_channels_store__.buffers.push(h);\n}\n})(),this.sourceBuffer.appendBuffer(h),y();"));
        assert!(rewrite.body.contains(r#"if(f.cmd==="CUT"){"#));
        assert!(rewrite.body.contains("=f.decryptor_array;"));
        assert!(rewrite.body.ends_with("if(f.cmd===re.MAIN_THREAD_CMD.AUTO_CUT){z()}"));
        assert_eq!(rewrite.misses().count(), 0);
        assert_eq!(rewrite.patches.len(), 2);
    }

    #[test]
    fn player_patch_drift_is_reported_per_rule() {
        let js = "this.sourceBuffer.appendBuffer(h),";
        let rewrite = rewriter().rewrite_script(PLAYER_PATH, js);
        let missed: Vec<_> = rewrite.misses().map(PatchOutcome::rule).collect();
        assert_eq!(missed, vec!["decrypt-key-capture"]);
    }

    #[test]
    fn feed_detail_patch_exports_profile() {
        let js = "class A{async finderGetCommentDetail(e){return this.api.post(e)}async other(){}}";
        let rewrite = rewriter().rewrite_script(FEED_DETAIL_PATH, js);

        assert!(rewrite.body.contains("async finderGetCommentDetail(e) {"));
        assert!(rewrite.body.contains("var feedResult = await this.api.post(e);"));
        assert!(rewrite.body.contains(r#"fetch("/__wx_channels_api/profile""#));
        assert!(rewrite.body.ends_with("return feedResult;\n}async other(){}}"));
        assert!(rewrite.misses().next().is_none());
    }

    #[test]
    fn unrelated_script_passes_through() {
        let js = "console.log(1)";
        let rewrite = rewriter().rewrite_script(FEED_DETAIL_PATH, js);
        assert_eq!(rewrite.body, js);
        assert_eq!(rewrite.misses().count(), 1);

        let other = rewriter().rewrite_script("/x.js", js);
        assert_eq!(other.body, js);
        assert!(other.patches.is_empty());
    }
}

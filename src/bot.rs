use axum::http::HeaderMap;
use regex::Regex;

pub const MIN_USER_AGENT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Crawler,
    Automation,
}

#[derive(Debug, Clone, Copy)]
pub struct RuleSpec {
    pub name: &'static str,
    pub category: Category,
    pub pattern: &'static str,
    pub unless: Option<&'static str>,
}

const fn crawler(name: &'static str, pattern: &'static str) -> RuleSpec {
    RuleSpec {
        name,
        category: Category::Crawler,
        pattern,
        unless: None,
    }
}

const fn automation(name: &'static str, pattern: &'static str) -> RuleSpec {
    RuleSpec {
        name,
        category: Category::Automation,
        pattern,
        unless: None,
    }
}

// Crawler rules first, first match wins. `unless` vetoes a match (regex has no lookahead).
pub const DEFAULT_RULES: &[RuleSpec] = &[
    crawler("googlebot", r"googlebot|google-inspectiontool|adsbot-google|mediapartners-google"),
    crawler("bingbot", r"bingbot|msnbot|bingpreview"),
    crawler("yahoo", r"slurp"),
    crawler("duckduckgo", r"duckduckbot|duckassistbot"),
    crawler("baidu", r"baiduspider"),
    crawler("yandex", r"yandexbot|yandexmobilebot"),
    crawler("apple", r"applebot"),
    crawler("facebook", r"facebookexternalhit|facebookcatalog"),
    crawler("twitter", r"twitterbot"),
    crawler("linkedin", r"linkedinbot"),
    crawler("slack", r"slackbot|slack-imgproxy"),
    crawler("discord", r"discordbot"),
    crawler("whatsapp", r"whatsapp"),
    crawler("telegram", r"telegrambot"),
    crawler("pinterest", r"pinterestbot|pinterest/0\."),
    automation("curl", r"\bcurl/"),
    automation("wget", r"\bwget/"),
    automation("python", r"python-requests|python-urllib|python-httpx|\bhttpx/|aiohttp"),
    automation("scrapy", r"scrapy"),
    automation("go", r"go-http-client"),
    automation("java", r"\bjava/|apache-httpclient|okhttp"),
    automation("perl", r"libwww-perl|\blwp::"),
    automation("php", r"\bphp/|guzzlehttp"),
    automation("node", r"node-fetch|\baxios/|undici|got \("),
    automation("headless", r"headlesschrome|phantomjs|slimerjs"),
    automation("webdriver", r"selenium|webdriver|puppeteer|playwright"),
    automation(
        "seo-scraper",
        r"ahrefsbot|semrushbot|mj12bot|dotbot|petalbot|bytespider|dataforseobot|blexbot",
    ),
    RuleSpec {
        name: "generic-bot",
        category: Category::Automation,
        pattern: r"bot\b|bot/|crawl|spider|scrape",
        unless: Some(
            r"googlebot|bingbot|duckduckbot|yandexbot|applebot|twitterbot|linkedinbot|slackbot|discordbot|telegrambot|pinterestbot|cubot",
        ),
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotDecision {
    AllowCrawler,
    Deny,
    Unclassified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub decision: BotDecision,
    pub matched_pattern: Option<&'static str>,
}

impl Classification {
    fn unclassified() -> Self {
        Self {
            decision: BotDecision::Unclassified,
            matched_pattern: None,
        }
    }
}

#[derive(Debug)]
struct Rule {
    name: &'static str,
    category: Category,
    pattern: Regex,
    unless: Option<Regex>,
}

impl Rule {
    fn compile(spec: &RuleSpec) -> Result<Self, regex::Error> {
        let case_insensitive = |p: &str| Regex::new(&format!("(?i){p}"));
        Ok(Self {
            name: spec.name,
            category: spec.category,
            pattern: case_insensitive(spec.pattern)?,
            unless: spec.unless.map(case_insensitive).transpose()?,
        })
    }

    fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text) && !self.unless.as_ref().is_some_and(|u| u.is_match(text))
    }
}

#[derive(Debug)]
pub struct BotClassifier {
    rules: Vec<Rule>,
    min_user_agent_len: usize,
}

impl Default for BotClassifier {
    fn default() -> Self {
        Self::from_rules(DEFAULT_RULES, MIN_USER_AGENT_LEN).expect("built-in bot rules are valid")
    }
}

impl BotClassifier {
    pub fn from_rules(specs: &[RuleSpec], min_user_agent_len: usize) -> Result<Self, regex::Error> {
        let rules = specs.iter().map(Rule::compile).collect::<Result<_, _>>()?;
        Ok(Self {
            rules,
            min_user_agent_len,
        })
    }

    fn first_match(&self, category: Category, text: &str) -> Option<&'static str> {
        self.rules
            .iter()
            .filter(|r| r.category == category)
            .find(|r| r.matches(text))
            .map(|r| r.name)
    }

    // Missing or too short to come from a real browser.
    pub fn is_implausible(&self, user_agent: Option<&str>) -> bool {
        user_agent.is_none_or(|ua| ua.trim().len() < self.min_user_agent_len)
    }

    pub fn classify(&self, user_agent: Option<&str>, headers: &HeaderMap) -> Classification {
        let ua = user_agent.unwrap_or_default();

        if let Some(name) = self.first_match(Category::Crawler, ua) {
            return Classification {
                decision: BotDecision::AllowCrawler,
                matched_pattern: Some(name),
            };
        }

        // Client hints leak headless browsers that spoof a desktop UA.
        let hints = headers
            .get("sec-ch-ua")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        [ua, hints]
            .into_iter()
            .filter(|text| !text.is_empty())
            .find_map(|text| self.first_match(Category::Automation, text))
            .map_or_else(Classification::unclassified, |name| Classification {
                decision: BotDecision::Deny,
                matched_pattern: Some(name),
            })
    }
}

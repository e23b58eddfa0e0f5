//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi
//!   esummary: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esummary.fcgi
//!   efetch:   https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi
//!
//! Every call goes through the shared request scheduler; NCBI tolerates
//! bursts badly and the whole process shares one quota.

use std::sync::{Arc, LazyLock};

use publink_common::{PublinkError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::publication::Candidate;
use crate::scheduler::RequestScheduler;

const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
const ESUMMARY_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esummary.fcgi";
const EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

/// efetch batches this many PMIDs per request.
const EFETCH_PAGE: usize = 200;

static NCT_MENTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"NCT\d{8}").unwrap());

/// One esummary row.
#[derive(Debug, Clone)]
pub struct PubmedSummary {
    pub pmid: String,
    pub title: String,
    pub publication_date: Option<String>,
}

/// One fully fetched PubMed record (efetch abstract mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubmedRecord {
    pub pmid: String,
    pub doi: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub abstract_text: Option<String>,
    pub publication_date: Option<String>,
    pub nct_ids: Vec<String>,
}

pub struct PubmedClient {
    client: reqwest::Client,
    scheduler: Arc<RequestScheduler>,
    api_key: Option<String>,
}

impl PubmedClient {
    pub fn new(scheduler: Arc<RequestScheduler>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            scheduler,
            api_key,
        }
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string())];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    async fn get_json(&self, url: &str, params: Vec<(&'static str, String)>) -> Result<serde_json::Value> {
        let resp = self.client.get(url).query(&params).send().await?;
        if !resp.status().is_success() {
            return Err(PublinkError::Pubmed(format!("HTTP {}", resp.status())));
        }
        Ok(resp.json().await?)
    }

    /// Search and return PMIDs in rank order.
    #[instrument(skip(self))]
    pub async fn esearch(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let query = query.to_string();
        self.scheduler
            .run("esearch", || {
                let query = query.clone();
                async move {
                    let mut params = self.base_params();
                    params.push(("term", query));
                    params.push(("retmax", limit.to_string()));
                    params.push(("retmode", "json".to_string()));
                    let resp = self.get_json(ESEARCH_URL, params).await?;
                    let ids: Vec<String> = resp["esearchresult"]["idlist"]
                        .as_array()
                        .unwrap_or(&vec![])
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect();
                    debug!(n = ids.len(), "esearch returned PMIDs");
                    Ok(ids)
                }
            })
            .await
    }

    /// esummary for a set of PMIDs: titles and publication dates.
    #[instrument(skip(self, pmids))]
    pub async fn esummary(&self, pmids: &[String]) -> Result<Vec<PubmedSummary>> {
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = pmids.join(",");
        self.scheduler
            .run("esummary", || {
                let joined = joined.clone();
                async move {
                    let mut params = self.base_params();
                    params.push(("id", joined));
                    params.push(("retmode", "json".to_string()));
                    let resp = self.get_json(ESUMMARY_URL, params).await?;
                    let result = &resp["result"];
                    let uids = result["uids"].as_array().cloned().unwrap_or_default();
                    let summaries = uids
                        .iter()
                        .filter_map(|u| u.as_str())
                        .map(|uid| {
                            let row = &result[uid];
                            PubmedSummary {
                                pmid: uid.to_string(),
                                title: row["title"].as_str().unwrap_or("").to_string(),
                                publication_date: row["sortpubdate"]
                                    .as_str()
                                    .or_else(|| row["pubdate"].as_str())
                                    .and_then(parse_pubmed_date),
                            }
                        })
                        .collect();
                    Ok(summaries)
                }
            })
            .await
    }

    /// Search returning candidates (PMID + date), the shape strategies emit.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let ids = self.esearch(query, limit).await?;
        let summaries = self.esummary(&ids).await?;
        Ok(summaries
            .into_iter()
            .map(|s| Candidate {
                pmid: s.pmid,
                publication_date: s.publication_date,
                doi: None,
            })
            .collect())
    }

    /// Title-field search returning summaries, for fuzzy title matching.
    pub async fn title_search(&self, title: &str, limit: usize) -> Result<Vec<PubmedSummary>> {
        let term = format!("{}[Title]", sanitize_term(title));
        let ids = self.esearch(&term, limit).await?;
        self.esummary(&ids).await
    }

    /// Exact-title citation match: quoted phrase in the title field.
    pub async fn citation_match(&self, title: &str) -> Result<Vec<String>> {
        let term = format!("\"{}\"[Title]", sanitize_term(title));
        self.esearch(&term, 3).await
    }

    /// Resolve a DOI to a PMID via the article-id field.
    pub async fn doi_to_pmid(&self, doi: &str) -> Result<Option<String>> {
        let term = format!("\"{}\"[AID]", doi.trim());
        let ids = self.esearch(&term, 1).await?;
        Ok(ids.into_iter().next())
    }

    /// Fetch full records for a set of PMIDs, paging the efetch calls.
    #[instrument(skip(self, pmids))]
    pub async fn fetch_refs(&self, pmids: &[String]) -> Result<Vec<PubmedRecord>> {
        let mut records = Vec::with_capacity(pmids.len());
        for page in pmids.chunks(EFETCH_PAGE) {
            let joined = page.join(",");
            let xml = self
                .scheduler
                .run("efetch", || {
                    let joined = joined.clone();
                    async move {
                        let mut params = self.base_params();
                        params.push(("id", joined));
                        params.push(("rettype", "abstract".to_string()));
                        params.push(("retmode", "xml".to_string()));
                        let resp = self.client.get(EFETCH_URL).query(&params).send().await?;
                        if !resp.status().is_success() {
                            return Err(PublinkError::Pubmed(format!("HTTP {}", resp.status())));
                        }
                        Ok(resp.text().await?)
                    }
                })
                .await?;
            records.extend(parse_pubmed_xml(&xml)?);
        }
        Ok(records)
    }
}

/// PubMed queries choke on stray brackets and quotes inside phrases.
fn sanitize_term(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '[' | ']' | '"' | '(' | ')'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Accepts "2012/05/01 00:00", "2012 May 3", "2012 May", "2012 May-Jun",
/// and bare years; returns an ISO prefix.
pub fn parse_pubmed_date(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if s.len() >= 10 && s.as_bytes()[4] == b'/' {
        let (y, m, d) = (&s[0..4], &s[5..7], &s[8..10]);
        if y.bytes().all(|b| b.is_ascii_digit())
            && m.bytes().all(|b| b.is_ascii_digit())
            && d.bytes().all(|b| b.is_ascii_digit())
        {
            return Some(format!("{y}-{m}-{d}"));
        }
    }

    let mut parts = s.split_whitespace();
    let year = parts.next()?;
    if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let month = parts.next().and_then(|m| month_number(m.split('-').next().unwrap_or(m)));
    let day = parts
        .next()
        .and_then(|d| d.parse::<u32>().ok())
        .filter(|d| (1..=31).contains(d));

    match (month, day) {
        (Some(m), Some(d)) => Some(format!("{year}-{m:02}-{d:02}")),
        (Some(m), None)    => Some(format!("{year}-{m:02}")),
        _                  => Some(year.to_string()),
    }
}

fn month_number(name: &str) -> Option<u32> {
    match name.to_ascii_lowercase().as_str() {
        "jan" | "january"   | "01" | "1"  => Some(1),
        "feb" | "february"  | "02" | "2"  => Some(2),
        "mar" | "march"     | "03" | "3"  => Some(3),
        "apr" | "april"     | "04" | "4"  => Some(4),
        "may"               | "05" | "5"  => Some(5),
        "jun" | "june"      | "06" | "6"  => Some(6),
        "jul" | "july"      | "07" | "7"  => Some(7),
        "aug" | "august"    | "08" | "8"  => Some(8),
        "sep" | "september" | "09" | "9"  => Some(9),
        "oct" | "october"   | "10"        => Some(10),
        "nov" | "november"  | "11"        => Some(11),
        "dec" | "december"  | "12"        => Some(12),
        _ => None,
    }
}

#[derive(Default)]
struct DateParts {
    year: Option<String>,
    month: Option<u32>,
    day: Option<u32>,
}

impl DateParts {
    fn render(&self) -> Option<String> {
        let year = self.year.as_ref()?;
        match (self.month, self.day) {
            (Some(m), Some(d)) => Some(format!("{year}-{m:02}-{d:02}")),
            (Some(m), None)    => Some(format!("{year}-{m:02}")),
            _                  => Some(year.clone()),
        }
    }
}

/// Parse efetch abstract-mode XML into records. Follows the
/// `<PubmedArticleSet><PubmedArticle>` structure with an event-driven
/// state machine.
pub fn parse_pubmed_xml(xml: &str) -> Result<Vec<PubmedRecord>> {
    let mut records = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<PubmedRecord> = None;
    let mut in_pmid = false;
    let mut in_title = false;
    let mut in_abstract = false;
    let mut in_author = false;
    let mut in_last_name = false;
    let mut in_fore_name = false;
    let mut in_accession = false;
    let mut article_id_type: Option<String> = None;

    // ArticleDate (electronic) wins over the journal PubDate.
    let mut in_article_date = false;
    let mut in_pub_date = false;
    let mut in_year = false;
    let mut in_month = false;
    let mut in_day = false;
    let mut article_date = DateParts::default();
    let mut pub_date = DateParts::default();

    let mut current_last = String::new();
    let mut current_fore = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"PubmedArticle" => {
                    current = Some(PubmedRecord::default());
                    article_date = DateParts::default();
                    pub_date = DateParts::default();
                }
                b"PMID" => in_pmid = true,
                b"ArticleTitle" => in_title = true,
                b"AbstractText" => in_abstract = true,
                b"Author" => {
                    in_author = true;
                    current_last.clear();
                    current_fore.clear();
                }
                b"LastName" => in_last_name = true,
                b"ForeName" => in_fore_name = true,
                b"AccessionNumber" => in_accession = true,
                b"ArticleDate" => in_article_date = true,
                b"PubDate" => in_pub_date = true,
                b"Year" => in_year = true,
                b"Month" => in_month = true,
                b"Day" => in_day = true,
                b"ArticleId" => {
                    article_id_type = e
                        .try_get_attribute("IdType")
                        .ok()
                        .flatten()
                        .and_then(|a| String::from_utf8(a.value.into_owned()).ok());
                }
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if let Some(ref mut record) = current {
                    if in_pmid && record.pmid.is_empty() {
                        record.pmid = text.clone();
                    }
                    if in_title {
                        record.title = Some(match record.title.take() {
                            Some(t) => format!("{t}{text}"),
                            None => text.clone(),
                        });
                    }
                    if in_abstract {
                        record.abstract_text = Some(match record.abstract_text.take() {
                            Some(a) => format!("{a} {text}"),
                            None => text.clone(),
                        });
                    }
                    if in_last_name { current_last = text.clone(); }
                    if in_fore_name { current_fore = text.clone(); }
                    if in_accession && NCT_MENTION_RE.is_match(&text) {
                        record.nct_ids.push(text.clone());
                    }
                    if article_id_type.as_deref() == Some("doi") && record.doi.is_none() {
                        record.doi = Some(text.clone());
                    }
                    if in_year || in_month || in_day {
                        let parts = if in_article_date {
                            Some(&mut article_date)
                        } else if in_pub_date {
                            Some(&mut pub_date)
                        } else {
                            None
                        };
                        if let Some(parts) = parts {
                            if in_year {
                                parts.year = Some(text.clone());
                            } else if in_month {
                                parts.month = month_number(&text);
                            } else if in_day {
                                parts.day = text.parse().ok();
                            }
                        }
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"PMID" => in_pmid = false,
                b"ArticleTitle" => in_title = false,
                b"AbstractText" => in_abstract = false,
                b"LastName" => in_last_name = false,
                b"ForeName" => in_fore_name = false,
                b"AccessionNumber" => in_accession = false,
                b"ArticleDate" => in_article_date = false,
                b"PubDate" => in_pub_date = false,
                b"Year" => in_year = false,
                b"Month" => in_month = false,
                b"Day" => in_day = false,
                b"ArticleId" => article_id_type = None,
                b"Author" => {
                    if in_author {
                        if let Some(ref mut record) = current {
                            let name = if current_fore.is_empty() {
                                current_last.clone()
                            } else {
                                format!("{current_fore} {current_last}")
                            };
                            if !name.is_empty() {
                                record.authors.push(name);
                            }
                        }
                        in_author = false;
                    }
                }
                b"PubmedArticle" => {
                    if let Some(mut record) = current.take() {
                        record.publication_date =
                            article_date.render().or_else(|| pub_date.render());
                        scan_nct_mentions(&mut record);
                        if record.pmid.is_empty() {
                            warn!("Skipping PubMed record without PMID");
                        } else {
                            records.push(record);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(PublinkError::Parse(format!("PubMed XML: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(records)
}

/// NCT ids also show up free-text in titles and abstracts.
fn scan_nct_mentions(record: &mut PubmedRecord) {
    for text in [record.title.as_deref(), record.abstract_text.as_deref()]
        .into_iter()
        .flatten()
    {
        for m in NCT_MENTION_RE.find_iter(text) {
            record.nct_ids.push(m.as_str().to_string());
        }
    }
    record.nct_ids.sort();
    record.nct_ids.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pubmed_date_shapes() {
        assert_eq!(parse_pubmed_date("2012/05/01 00:00"), Some("2012-05-01".to_string()));
        assert_eq!(parse_pubmed_date("2012 May 3"), Some("2012-05-03".to_string()));
        assert_eq!(parse_pubmed_date("2012 May"), Some("2012-05".to_string()));
        assert_eq!(parse_pubmed_date("2012 May-Jun"), Some("2012-05".to_string()));
        assert_eq!(parse_pubmed_date("2012"), Some("2012".to_string()));
        assert_eq!(parse_pubmed_date("Spring 2012"), None);
        assert_eq!(parse_pubmed_date(""), None);
    }

    const XML: &str = r#"<?xml version="1.0"?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>12345678</PMID>
      <Article>
        <ArticleTitle>Aspirin versus placebo: a randomized trial</ArticleTitle>
        <Abstract>
          <AbstractText Label="BACKGROUND">Background text.</AbstractText>
          <AbstractText Label="RESULTS">Registered as NCT00000001.</AbstractText>
        </Abstract>
        <AuthorList>
          <Author><LastName>Doe</LastName><ForeName>Jane</ForeName></Author>
          <Author><LastName>Smith</LastName><ForeName>John</ForeName></Author>
        </AuthorList>
        <ArticleDate DateType="Electronic">
          <Year>2009</Year><Month>03</Month><Day>15</Day>
        </ArticleDate>
        <Journal>
          <JournalIssue><PubDate><Year>2009</Year><Month>May</Month></PubDate></JournalIssue>
        </Journal>
        <DataBankList>
          <DataBank>
            <DataBankName>ClinicalTrials.gov</DataBankName>
            <AccessionNumberList><AccessionNumber>NCT00000001</AccessionNumber></AccessionNumberList>
          </DataBank>
        </DataBankList>
      </Article>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">12345678</ArticleId>
        <ArticleId IdType="doi">10.1000/trial.1</ArticleId>
      </ArticleIdList>
    </PubmedData>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_full_record() {
        let records = parse_pubmed_xml(XML).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.pmid, "12345678");
        assert_eq!(r.doi.as_deref(), Some("10.1000/trial.1"));
        assert_eq!(
            r.title.as_deref(),
            Some("Aspirin versus placebo: a randomized trial")
        );
        assert_eq!(r.authors, vec!["Jane Doe", "John Smith"]);
        assert!(r.abstract_text.as_deref().unwrap().contains("Background text."));
        // Electronic article date wins over the journal issue date.
        assert_eq!(r.publication_date.as_deref(), Some("2009-03-15"));
        assert_eq!(r.nct_ids, vec!["NCT00000001"]);
    }

    #[test]
    fn test_parse_empty_set() {
        let records = parse_pubmed_xml("<PubmedArticleSet></PubmedArticleSet>").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_sanitize_term_strips_query_syntax() {
        assert_eq!(
            sanitize_term("A [big] \"quoted\" (title)"),
            "A big quoted title"
        );
    }
}

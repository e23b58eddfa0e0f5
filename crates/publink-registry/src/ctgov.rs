//! ClinicalTrials.gov v2 API adapter.
//!
//! API docs: https://clinicaltrials.gov/data-api/api
//! Endpoint: https://clinicaltrials.gov/api/v2/studies/{nctId}
//!
//! When a local directory of pre-fetched study JSON is configured, the
//! adapter reads `{trialId}.json` from there first and only falls back
//! to the network on a miss.

use std::path::PathBuf;

use publink_common::{FetchKind, PublinkError, Registry, Result};
use tracing::{debug, instrument};

use crate::registration::{normalize_date, Reference, Registration};

const CTGOV_API_URL: &str = "https://clinicaltrials.gov/api/v2/studies";

pub struct CtgovAdapter {
    client: reqwest::Client,
    local_dir: Option<PathBuf>,
}

impl CtgovAdapter {
    pub fn new(client: reqwest::Client, local_dir: Option<PathBuf>) -> Self {
        Self { client, local_dir }
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, trial_id: &str) -> Result<Registration> {
        if let Some(study) = self.read_local(trial_id) {
            debug!(trial_id, "CTGov study served from local directory");
            return parse_study(trial_id, &study);
        }

        let url = format!("{CTGOV_API_URL}/{trial_id}");
        let resp = self
            .client
            .get(&url)
            .query(&[("format", "json")])
            .send()
            .await
            .map_err(|e| transport(trial_id, e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PublinkError::RegistryFetch {
                trial_id: trial_id.to_string(),
                kind: FetchKind::NotFound,
                message: "no such study".to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(PublinkError::RegistryFetch {
                trial_id: trial_id.to_string(),
                kind: FetchKind::Transport,
                message: format!("HTTP {}", resp.status()),
            });
        }

        let study: serde_json::Value = resp.json().await.map_err(|e| transport(trial_id, e))?;
        parse_study(trial_id, &study)
    }

    fn read_local(&self, trial_id: &str) -> Option<serde_json::Value> {
        let dir = self.local_dir.as_ref()?;
        let raw = std::fs::read_to_string(dir.join(format!("{trial_id}.json"))).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

fn transport(trial_id: &str, e: reqwest::Error) -> PublinkError {
    PublinkError::RegistryFetch {
        trial_id: trial_id.to_string(),
        kind: FetchKind::Transport,
        message: e.to_string(),
    }
}

fn parse_study(trial_id: &str, study: &serde_json::Value) -> Result<Registration> {
    let proto = &study["protocolSection"];
    let id_mod = &proto["identificationModule"];
    let desc_mod = &proto["descriptionModule"];
    let status_mod = &proto["statusModule"];
    let design_mod = &proto["designModule"];
    let elig_mod = &proto["eligibilityModule"];
    let cond_mod = &proto["conditionsModule"];
    let interv_mod = &proto["armsInterventionsModule"];
    let contacts_mod = &proto["contactsLocationsModule"];
    let sponsor_mod = &proto["sponsorCollaboratorsModule"];
    let refs_mod = &proto["referencesModule"];

    let mut reg = Registration::new(trial_id, Registry::Ctgov);

    reg.brief_title = id_mod["briefTitle"].as_str().map(String::from);
    reg.official_title = id_mod["officialTitle"].as_str().map(String::from);
    reg.acronym = id_mod["acronym"].as_str().map(String::from);

    reg.brief_summary = desc_mod["briefSummary"].as_str().map(String::from);
    reg.detailed_description = desc_mod["detailedDescription"].as_str().map(String::from);

    reg.overall_status = status_mod["overallStatus"].as_str().map(String::from);
    reg.start_date = status_mod["startDateStruct"]["date"]
        .as_str()
        .and_then(normalize_date);
    reg.completion_date = status_mod["completionDateStruct"]["date"]
        .as_str()
        .and_then(normalize_date);

    reg.organization = sponsor_mod["leadSponsor"]["name"].as_str().map(String::from);
    reg.investigator_full_name = sponsor_mod["responsibleParty"]["investigatorFullName"]
        .as_str()
        .map(String::from);
    reg.principal_investigators = contacts_mod["overallOfficials"]
        .as_array()
        .map(|officials| {
            officials
                .iter()
                .filter(|o| o["role"].as_str() == Some("PRINCIPAL_INVESTIGATOR"))
                .filter_map(|o| o["name"].as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    reg.study_type = design_mod["studyType"].as_str().map(String::from);
    reg.phase = design_mod["phases"]
        .as_array()
        .map(|phases| {
            phases
                .iter()
                .filter_map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join("/")
        })
        .filter(|p| !p.is_empty());
    reg.sex = elig_mod["sex"].as_str().map(String::from);

    reg.conditions = cond_mod["conditions"]
        .as_array()
        .map(|c| c.iter().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default();
    reg.interventions = interv_mod["interventions"]
        .as_array()
        .map(|iv| {
            iv.iter()
                .filter_map(|v| v["name"].as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    reg.has_results = study["hasResults"].as_bool();

    reg.references = refs_mod["references"]
        .as_array()
        .map(|refs| {
            refs.iter()
                .map(|r| Reference {
                    pmid: r["pmid"].as_str().map(String::from),
                    citation: r["citation"].as_str().map(String::from),
                })
                .collect()
        })
        .unwrap_or_default();

    reg.validate()?;
    Ok(reg)
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub(crate) struct SettingsResponse {
    #[serde(default)]
    pub(crate) settings: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) artifact: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SettingBody<'a> {
    pub(crate) value: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ArtifactBody {
    pub(crate) image: String,
}

#[derive(Deserialize)]
pub(crate) struct RegistryCredentials {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DatabaseEndpoint {
    pub(crate) fqdn: String,
}

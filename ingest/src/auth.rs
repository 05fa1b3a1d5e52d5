use serde_json::Value;
use tracing::instrument;

use crate::api::IngestError;
use crate::request::{EventFormData, EventQuery, RawRequest};
use crate::team::{Team, TeamStore};

/// Token discovery across the request surfaces, first match wins:
/// explicit `api_key` param, explicit `token` param, then the payload's
/// own fallback chain. An empty value counts as absent for each source.
pub fn discover_token(
    query: &EventQuery,
    form: &EventFormData,
    payload: &RawRequest,
) -> Option<String> {
    let param = |value: &Option<String>| value.clone().filter(|t| !t.is_empty());

    param(&query.api_key)
        .or_else(|| param(&form.api_key))
        .or_else(|| param(&query.token))
        .or_else(|| param(&form.token))
        .or_else(|| payload.extract_token())
}

/// Explicit tenant id for the personal-credential path. A present but
/// non-numeric value is a client error; absence is not.
pub fn resolve_project_id(
    query: &EventQuery,
    form: &EventFormData,
    payload: &RawRequest,
) -> Result<Option<i64>, IngestError> {
    if let Some(explicit) = query.project_id.as_deref().or(form.project_id.as_deref()) {
        return explicit
            .parse::<i64>()
            .map(Some)
            .map_err(|_| IngestError::InvalidProjectId);
    }

    match payload.project_id_field() {
        None => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or(IngestError::InvalidProjectId),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| IngestError::InvalidProjectId),
        Some(_) => Err(IngestError::InvalidProjectId),
    }
}

/// Resolves the request to exactly one team.
///
/// Public tokens map to a team directly. A token that doesn't is
/// reinterpreted as a personal API key, which needs an explicit project id
/// and membership in that project. The project id check runs before the
/// credential lookup so that an unusable project id never reveals whether
/// the personal key itself was valid.
#[instrument(skip_all, fields(team_id))]
pub async fn authenticate(
    store: &dyn TeamStore,
    token: &str,
    query: &EventQuery,
    form: &EventFormData,
    payload: &RawRequest,
) -> Result<Team, IngestError> {
    if let Some(team) = store.team_by_token(token).await? {
        tracing::Span::current().record("team_id", team.id);
        return Ok(team);
    }

    let project_id = match resolve_project_id(query, form, payload)? {
        Some(id) => id,
        // Deliberately indistinguishable from a bad public token
        None => return Err(IngestError::InvalidApiKey),
    };

    let user = store
        .user_by_personal_key(token)
        .await?
        .ok_or(IngestError::InvalidPersonalApiKey)?;

    let team = store
        .team_for_user(&user, project_id)
        .await?
        // Membership is enforced by the lookup, not as a separate check
        .ok_or(IngestError::InvalidPersonalApiKey)?;

    tracing::Span::current().record("team_id", team.id);
    Ok(team)
}

use crate::{
    services::setup::SetupServiceError,
    session::{CommandError, SessionView},
};
use actix_web::{HttpResponse, http::StatusCode};
use anyhow::{Context, Result, ensure};
use log::{error, warn};
use reqwest::Response;

/// Trait for converting service results into HTTP responses
pub trait ServiceResultResponse {
    fn into_response(self) -> HttpResponse;
}

impl ServiceResultResponse for SessionView {
    fn into_response(self) -> HttpResponse {
        match serde_json::to_string(&self) {
            Ok(json) => HttpResponse::Ok()
                .content_type("application/json")
                .body(json),
            Err(e) => {
                error!("failed to serialize SessionView: {e:#}");
                HttpResponse::InternalServerError().body("failed to serialize response")
            }
        }
    }
}

impl SetupServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            SetupServiceError::NoFacilitySelected => StatusCode::NOT_FOUND,
            SetupServiceError::Command(CommandError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            SetupServiceError::Busy(_) | SetupServiceError::Command(_) => StatusCode::CONFLICT,
        }
    }
}

/// Handle Result and convert data to Response
///
/// Client errors (no facility, wrong step, bad input) are logged as warnings
/// and mapped to 4xx responses carrying the error text.
///
/// # Arguments
/// * `result` - The Result to handle
/// * `operation` - Context message describing the operation
pub fn handle_service_result<T>(
    result: std::result::Result<T, SetupServiceError>,
    operation: &str,
) -> HttpResponse
where
    T: ServiceResultResponse,
{
    match result {
        Ok(data) => data.into_response(),
        Err(e) => {
            warn!("{operation} rejected: {e}");
            HttpResponse::build(e.status_code()).body(e.to_string())
        }
    }
}

/// Handle HTTP response by checking status and extracting body
///
/// This is a common utility for processing HTTP responses.
/// It ensures the response status is successful and extracts the body text.
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "GET /api/v1/devices")
///
/// # Returns
/// * `Ok(String)` - The response body if the status is successful
/// * `Err` - If the status is not successful or reading the body fails
pub async fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::{CompletedSteps, FlowError, FlowEvent, SetupFlowState},
        session::StepView,
    };

    #[test]
    fn no_facility_maps_to_not_found() {
        let response = handle_service_result::<SessionView>(
            Err(SetupServiceError::NoFacilitySelected),
            "test",
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn wrong_step_maps_to_conflict() {
        let response = handle_service_result::<SessionView>(
            Err(SetupServiceError::Command(CommandError::StepNotActive {
                expected: SetupFlowState::Configure,
                current: SetupFlowState::PvSystem,
            })),
            "test",
        );
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn illegal_transition_maps_to_conflict() {
        let response = handle_service_result::<SessionView>(
            Err(SetupServiceError::Command(CommandError::Flow(
                FlowError::IllegalTransition {
                    state: SetupFlowState::Complete,
                    event: FlowEvent::StepFinished,
                },
            ))),
            "test",
        );
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn busy_session_maps_to_conflict() {
        let response =
            handle_service_result::<SessionView>(Err(SetupServiceError::Busy(42)), "test");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn bad_slot_maps_to_bad_request() {
        let response = handle_service_result::<SessionView>(
            Err(SetupServiceError::Command(CommandError::InvalidInput(
                "location slot 20 does not exist".to_string(),
            ))),
            "test",
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn view_maps_to_json_ok() {
        let view = SessionView {
            facility_id: 42,
            facility: None,
            state: SetupFlowState::Configure,
            completed: CompletedSteps::default(),
            step: StepView::Configure,
            error: None,
            running: false,
        };
        let response = handle_service_result(Ok(view), "test");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(actix_web::http::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            Some("application/json")
        );
    }
}

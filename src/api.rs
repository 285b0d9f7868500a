use crate::{
    backend_client::{DeviceId, DeviceTemplateId, FacilityId, SetupBackend},
    http_client::handle_service_result,
    services::setup::SetupService,
};
use actix_web::{HttpResponse, Responder, web};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use std::sync::Arc;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SelectFacilityPayload {
    #[validate(minimum = 1)]
    facility_id: FacilityId,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SelectPvSystemPayload {
    #[validate(minimum = 1)]
    template_id: DeviceTemplateId,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SensorKitCodePayload {
    #[validate(max_length = 32)]
    #[validate(pattern = r"^\s*[A-Za-z0-9]*\s*$")]
    code: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AssignLocationPayload {
    #[validate(minimum = 1)]
    device_id: DeviceId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthcheckInfo {
    version: &'static str,
    facility_id: Option<FacilityId>,
}

pub struct Api<Backend>
where
    Backend: SetupBackend,
{
    pub setup: Arc<SetupService<Backend>>,
}

impl<Backend> Clone for Api<Backend>
where
    Backend: SetupBackend,
{
    fn clone(&self) -> Self {
        Api {
            setup: self.setup.clone(),
        }
    }
}

macro_rules! validated {
    ($body:expr, $operation:expr) => {
        if let Err(e) = $body.validate() {
            warn!("{} rejected: {e}", $operation);
            return HttpResponse::BadRequest().body(e.to_string());
        }
    };
}

impl<Backend> Api<Backend>
where
    Backend: SetupBackend + 'static,
{
    pub fn new(setup: SetupService<Backend>) -> Self {
        Api {
            setup: Arc::new(setup),
        }
    }

    pub async fn healthcheck(api: web::Data<Self>) -> impl Responder {
        debug!("healthcheck() called");

        HttpResponse::Ok().json(HealthcheckInfo {
            version: env!("CARGO_PKG_VERSION"),
            facility_id: api.setup.view().ok().map(|view| view.facility_id),
        })
    }

    pub async fn version() -> impl Responder {
        HttpResponse::Ok().body(env!("CARGO_PKG_VERSION"))
    }

    pub async fn select_facility(
        body: web::Json<SelectFacilityPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("select_facility() called: {body:?}");
        validated!(body, "select_facility");

        handle_service_result(Ok(api.setup.select_facility(body.facility_id)), "select_facility")
    }

    pub async fn view(api: web::Data<Self>) -> impl Responder {
        debug!("view() called");
        handle_service_result(api.setup.view(), "view")
    }

    pub async fn select_pv_system(
        body: web::Json<SelectPvSystemPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("select_pv_system() called: {body:?}");
        validated!(body, "select_pv_system");

        handle_service_result(
            api.setup.select_pv_system(body.template_id).await,
            "select_pv_system",
        )
    }

    pub async fn submit_sensor_kit_code(
        body: web::Json<SensorKitCodePayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("submit_sensor_kit_code() called");
        validated!(body, "submit_sensor_kit_code");

        handle_service_result(
            api.setup.submit_sensor_kit_code(&body.code).await,
            "submit_sensor_kit_code",
        )
    }

    pub async fn assign_location(
        slot: web::Path<usize>,
        body: web::Json<AssignLocationPayload>,
        api: web::Data<Self>,
    ) -> impl Responder {
        debug!("assign_location() called: slot {slot} {body:?}");
        validated!(body, "assign_location");

        handle_service_result(
            api.setup.assign_location(slot.into_inner(), body.device_id),
            "assign_location",
        )
    }

    pub async fn clear_location(slot: web::Path<usize>, api: web::Data<Self>) -> impl Responder {
        debug!("clear_location() called: slot {slot}");

        handle_service_result(
            api.setup.clear_location(slot.into_inner()),
            "clear_location",
        )
    }

    pub async fn confirm_locations(api: web::Data<Self>) -> impl Responder {
        debug!("confirm_locations() called");
        handle_service_result(api.setup.confirm_locations().await, "confirm_locations")
    }

    pub async fn configure(api: web::Data<Self>) -> impl Responder {
        debug!("configure() called");
        handle_service_result(api.setup.configure().await, "configure")
    }

    pub async fn retry(api: web::Data<Self>) -> impl Responder {
        debug!("retry() called");
        handle_service_result(api.setup.retry().await, "retry")
    }

    /// Register the setup routes on an actix app or scope.
    pub fn configure_routes(config: &mut web::ServiceConfig) {
        config
            .route("/healthcheck", web::get().to(Self::healthcheck))
            .route("/version", web::get().to(Self::version))
            .service(
                web::scope("/setup")
                    .route("", web::get().to(Self::view))
                    .route("/facility", web::put().to(Self::select_facility))
                    .route("/pv-system", web::post().to(Self::select_pv_system))
                    .route("/sensor-kit", web::post().to(Self::submit_sensor_kit_code))
                    .route(
                        "/locations/confirm",
                        web::post().to(Self::confirm_locations),
                    )
                    .service(
                        web::resource("/locations/{slot}")
                            .route(web::put().to(Self::assign_location))
                            .route(web::delete().to(Self::clear_location)),
                    )
                    .route("/configure", web::post().to(Self::configure))
                    .route("/retry", web::post().to(Self::retry)),
            );
    }
}

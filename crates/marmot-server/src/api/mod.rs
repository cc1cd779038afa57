use crate::services::Services;
use poem::Route;
use poem_openapi::{OpenApiService, Tags};

pub mod healthcheck;
pub mod runs;
pub mod schedules;

#[derive(Tags)]
enum ApiTags {
    Runs,
    Schedules,
    HealthCheck,
}

pub fn combined_routes(services: &Services) -> Route {
    let api_service = make_open_api_service(services);

    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new().nest("/", api_service).nest("/docs", ui).nest("/specs", spec)
}

type ApiServices = (runs::RunsApi, schedules::SchedulesApi, healthcheck::HealthcheckApi);

pub fn make_open_api_service(services: &Services) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (
            runs::RunsApi::new(services.runs.clone(), services.config.core.stale_run_timeout),
            schedules::SchedulesApi::new(services.schedules.clone()),
            healthcheck::HealthcheckApi,
        ),
        "Marmot Ingestion Control Plane API",
        crate::VERSION,
    )
}

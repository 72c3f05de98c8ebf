//! Full video game database journey against https://videogamedb.uk.
//!
//! Override the run with `USERS`, `RAMP_DURATION` and `TEST_DURATION`
//! (seconds), and the log level with `RUST_LOG`:
//!
//! ```text
//! USERS=20 RAMP_DURATION=30 cargo run --example video_game_db --features reqwest
//! ```

use std::{sync::Arc, time::Duration};

use rand::{distr::Alphanumeric, Rng};
use stampede::{
    assertion::{self, Assertion},
    check::Check,
    feeder::GeneratorFeeder,
    report::StdoutReporter,
    transport::ReqwestTransport,
    Engine, HttpProtocol, HttpRequest, InjectionProfile, Record, Reporter, RunSettings, Scenario,
    Step,
};
use tracing_subscriber::EnvFilter;

const NEW_GAME_TEMPLATE: &str = r##"{
  "category": "#{category}",
  "name": "#{gameName}",
  "rating": "#{rating}",
  "releaseDate": "#{releaseDate}",
  "reviewScore": #{reviewScore}
}"##;

#[derive(Record)]
#[record(rename_all = "camelCase")]
struct NewGame {
    game_id: u32,
    game_name: String,
    release_date: String,
    review_score: u32,
    category: String,
    rating: String,
}

fn letters(rng: &mut impl Rng, n: usize) -> String {
    rng.sample_iter(Alphanumeric)
        .filter(u8::is_ascii_alphabetic)
        .take(n)
        .map(char::from)
        .collect()
}

fn new_game(rng: &mut impl Rng) -> NewGame {
    NewGame {
        game_id: rng.random_range(1..=10),
        game_name: format!("{}-gameName", letters(rng, 5)),
        release_date: format!(
            "{}-{:02}-{:02}",
            rng.random_range(1926..=2025),
            rng.random_range(1..=12),
            rng.random_range(1..=28)
        ),
        review_score: rng.random_range(0..100),
        category: format!("{}-category", letters(rng, 5)),
        rating: format!("{}-rating", letters(rng, 4)),
    }
}

fn scenario() -> Scenario {
    let games = GeneratorFeeder::new("newGames", |rng| new_game(rng).into());
    let think = || Step::pause(Duration::from_secs(5));

    Scenario::builder()
        .name("Video Game Db - full journey")
        .steps(vec![Step::forever(vec![
            Step::request(
                HttpRequest::get("Get all video games", "/videogame")
                    .check(Check::status().is(200)),
            ),
            think(),
            Step::request(
                HttpRequest::post("Authenticate", "/authenticate")
                    .body(r#"{"password": "admin", "username": "admin"}"#)
                    .check(Check::json_path("$.token").save_as("jwtToken")),
            ),
            think(),
            Step::feed(games),
            Step::request(
                HttpRequest::post("Create New Game - #{gameName}", "/videogame")
                    .header("Authorization", "Bearer #{jwtToken}")
                    .body(NEW_GAME_TEMPLATE)
                    .as_json()
                    .check(Check::body_string().save_as("responseBody")),
            ),
            Step::exec(|session| {
                if let Some(body) = session.get_str("responseBody") {
                    tracing::debug!(user = session.user_id(), "Created: {body}");
                }
                session
            }),
            think(),
            Step::request(HttpRequest::get(
                "Get specific video game",
                "/videogame/#{gameId}",
            )),
            think(),
            Step::request(
                HttpRequest::delete("Delete video game", "/videogame/#{gameId}")
                    .header("Authorization", "Bearer #{jwtToken}")
                    .check(Check::body_string().is("Video game deleted")),
            ),
        ])])
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = RunSettings::resolve(|key| std::env::var(key).ok())?;
    tracing::info!("Running test with {} users", settings.users);
    tracing::info!("Ramping users over {:?}", settings.ramp_duration);
    tracing::info!("Total test duration: {:?}", settings.test_duration);

    let protocol = HttpProtocol::builder()
        .base_url("https://videogamedb.uk/api")
        .build()
        .accept("application/json")
        .content_type("application/json");

    let engine = Engine::builder()
        .injection(
            InjectionProfile::new()
                .nothing_for(Duration::from_secs(5))
                .ramp_users(settings.users, settings.ramp_duration),
        )
        .protocol(protocol)
        .max_duration(settings.test_duration)
        .build();

    let transport = ReqwestTransport::new(
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?,
    );
    let summary = engine.exec(scenario(), Arc::new(transport)).await?;
    tracing::info!(users = ?summary.users, "Stress test finished");

    let report = summary.report();
    StdoutReporter.report(&report).await?;

    let assertions = [
        Assertion::global().failed_percent().lt(5.0),
        Assertion::global().max_response_time().lt(5_000.0),
        Assertion::step("Get all video games").percentile(95.0).lt(1_000.0),
    ];
    for result in assertion::evaluate_all(&assertions, &summary.stats) {
        println!("{result}");
    }
    Ok(())
}

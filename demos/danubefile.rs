//! A complete pipeline: lint, test, build and an approved deploy
//!
//! ```bash
//! cargo run --example danubefile -- --dry-run
//! cargo run --example danubefile -- --param DEPLOY=false
//! ```

use danube::prelude::*;
use std::process::ExitCode;
use std::time::Duration;

fn main() -> ExitCode {
    let base_image = Image::file("./Dockerfile");
    let build_image = Image::name("python:3.11-slim");

    let def = PipelineDef::new(base_image)
        .name("danube")
        .env("PYTHONPATH", "/workspace")
        .triggers(
            Triggers::new()
                .branch("^main$")
                .branch("^dev$")
                .branch("^feat:.*$")
                .event("push")
                .event("pull_request"),
        )
        .param(BuildParam::bool("DEPLOY", "Whether deployment requires approval", true))
        .secret(SecretRef::new("API_KEY", "api-key").with_description("Deployment API key"));

    run_pipeline(def, |pipeline| {
        if !pipeline.is_triggered() {
            return Err(Flow::stop(format!("branch {} has no trigger", pipeline.branch())));
        }

        pipeline.stage("Sanity checks", |s| {
            s.parallel(|batch| {
                batch.submit(move || {
                    s.run("ruff check .")?;
                    Ok(())
                });
                batch.submit(move || {
                    s.run("pyright .")?;
                    Ok(())
                });
            })
        })?;

        pipeline.stage(StageSpec::new("Test").timeout(Duration::from_secs(100)), |s| {
            let result = s.run("coverage run -m pytest tests")?;
            if result.is_failure() {
                return s.stop("Tests failed");
            }
            s.run("coverage html")?;
            pipeline.save_artifact("coverage-report", "htmlcov/index.html")?;
            Ok(())
        })?;

        if pipeline.branch() != "main" {
            return Err(Flow::stop("not on main, skipping build and deploy"));
        }

        pipeline.stage(StageSpec::new("Build").image(build_image.clone()), |s| {
            s.run("uv build")?;
            pipeline.save_artifact("dist-package", "dist/*.whl")?;
            Ok(())
        })?;

        if !pipeline.params().bool("DEPLOY")? {
            return Err(Flow::stop("deployment not requested"));
        }

        pipeline.stage(StageSpec::new("Deploy").image(build_image), |s| {
            if !s.confirm("deploy", "Deploy?", Duration::from_secs(10))? {
                return s.stop("Deployment cancelled");
            }
            let api_key = pipeline.get_secret("API_KEY")?;
            let preview: String = api_key.expose().chars().take(4).collect();
            s.run(format!("echo 'Deploying with API key: {preview}...'"))?;
            Ok(())
        })?;

        pipeline.stage("Notify", |s| {
            s.log("Sending notification to Slack");
            s.run("echo 'Deployment complete'")?;
            Ok(())
        })
    })
}

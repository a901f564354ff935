use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tipcal::image::io::load_gray_image;
use tipcal::nalgebra::{Matrix3, Point2};
use tipcal::synthetic::{SimConfig, SimRig};
use tipcal::{
    AxisConfig, CalibConfig, Calibrator, FocusConfig, PlatformConfig, Progress, RecalConfig,
    SettleConfig, Template, TemplateConfig, VisionMatcher, ZnccConfig, ZnccMatcher,
};
use tracing_subscriber::EnvFilter;

const SCHEMA_JSON: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config.schema.json"));
const EXAMPLE_JSON: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.json"));

/// Upper bound on ticks for one simulated run.
const MAX_TICKS: usize = 1000;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tipcal CLI (JSON config driven)")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,
    /// Print the JSON schema and exit.
    #[arg(long)]
    print_schema: bool,
    /// Print an example config and exit.
    #[arg(long)]
    print_example: bool,
    /// Enable tracing output for every calibration stage.
    #[arg(long)]
    trace: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate the simulated rig described by the config.
    Simulate,
    /// Locate a template in an image with the ZNCC matcher.
    Locate,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimJson {
    /// True arm-to-stage matrix, row major.
    jacobian: [[f64; 3]; 3],
    um_px: f64,
    camera_rotation_deg: f64,
    focus_falloff: f64,
    found_threshold: f64,
    noise_px: f64,
    seed: u64,
    frame_width: usize,
    frame_height: usize,
}

impl Default for SimJson {
    fn default() -> Self {
        let cfg = SimConfig::default();
        Self {
            jacobian: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            um_px: cfg.um_px,
            camera_rotation_deg: cfg.camera_rotation_deg,
            focus_falloff: cfg.focus_falloff,
            found_threshold: cfg.found_threshold,
            noise_px: cfg.noise_px,
            seed: cfg.seed,
            frame_width: cfg.frame_size.0,
            frame_height: cfg.frame_size.1,
        }
    }
}

impl SimJson {
    fn jacobian(&self) -> Matrix3<f64> {
        let j = &self.jacobian;
        Matrix3::new(
            j[0][0], j[0][1], j[0][2], //
            j[1][0], j[1][1], j[1][2], //
            j[2][0], j[2][1], j[2][2],
        )
    }

    fn to_config(&self) -> SimConfig {
        let frame_size = (self.frame_width, self.frame_height);
        SimConfig {
            jacobian: self.jacobian(),
            um_px: self.um_px,
            camera_rotation_deg: self.camera_rotation_deg,
            image_centre: Point2::new(
                frame_size.0 as f64 / 2.0,
                frame_size.1 as f64 / 2.0,
            ),
            focus_falloff: self.focus_falloff,
            found_threshold: self.found_threshold,
            noise_px: self.noise_px,
            seed: self.seed,
            frame_size,
            ..SimConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FocusJson {
    samples: usize,
    step: f64,
    early_exit_score: f64,
}

impl Default for FocusJson {
    fn default() -> Self {
        let cfg = FocusConfig::default();
        Self {
            samples: cfg.samples,
            step: cfg.step,
            early_exit_score: cfg.early_exit_score,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TemplateJson {
    half_range: usize,
    step: f64,
    zone_fraction: f64,
}

impl Default for TemplateJson {
    fn default() -> Self {
        let cfg = TemplateConfig::default();
        Self {
            half_range: cfg.half_range,
            step: cfg.step,
            zone_fraction: cfg.zone_fraction,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AxisJson {
    initial_step: f64,
    retries: usize,
    probe_distance: f64,
}

impl Default for AxisJson {
    fn default() -> Self {
        let axis = AxisConfig::default();
        Self {
            initial_step: axis.initial_step,
            retries: axis.retries,
            probe_distance: PlatformConfig::default().probe_distance,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RecalJson {
    retract: f64,
    advance: f64,
    approach_step: f64,
    accept_score: f64,
    max_approach_steps: usize,
    max_refocus_attempts: usize,
    zone_margin: usize,
}

impl Default for RecalJson {
    fn default() -> Self {
        let cfg = RecalConfig::default();
        Self {
            retract: cfg.retract,
            advance: cfg.advance,
            approach_step: cfg.approach_step,
            accept_score: cfg.accept_score,
            max_approach_steps: cfg.max_approach_steps,
            max_refocus_attempts: cfg.max_refocus_attempts,
            zone_margin: cfg.zone_margin,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SettleJson {
    after_move_ms: u64,
    after_restore_ms: u64,
}

impl Default for SettleJson {
    fn default() -> Self {
        let cfg = SettleConfig::default();
        Self {
            after_move_ms: cfg.after_move.as_millis() as u64,
            after_restore_ms: cfg.after_restore.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ZnccJson {
    min_var_i: f32,
    found_threshold: f64,
}

impl Default for ZnccJson {
    fn default() -> Self {
        let cfg = ZnccConfig::default();
        Self {
            min_var_i: cfg.min_var_i,
            found_threshold: cfg.found_threshold,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    simulation: SimJson,
    template: TemplateJson,
    focus: FocusJson,
    axis: AxisJson,
    recal: RecalJson,
    settle: SettleJson,
    /// Pixel to click once calibrated.
    click: Option<[f64; 2]>,
    /// Tip offset introduced by a simulated pipette swap after calibration.
    swap_tip_offset: Option<[f64; 3]>,
    image_path: String,
    template_path: String,
    zncc: ZnccJson,
    output_path: Option<String>,
}

impl Config {
    fn calib_config(&self) -> CalibConfig {
        CalibConfig {
            template: TemplateConfig {
                half_range: self.template.half_range,
                step: self.template.step,
                zone_fraction: self.template.zone_fraction,
            },
            platform: PlatformConfig {
                probe_distance: self.axis.probe_distance,
            },
            axis: AxisConfig {
                initial_step: self.axis.initial_step,
                retries: self.axis.retries,
            },
            focus: FocusConfig {
                samples: self.focus.samples,
                step: self.focus.step,
                early_exit_score: self.focus.early_exit_score,
            },
            recal: RecalConfig {
                retract: self.recal.retract,
                advance: self.recal.advance,
                approach_step: self.recal.approach_step,
                accept_score: self.recal.accept_score,
                max_approach_steps: self.recal.max_approach_steps,
                max_refocus_attempts: self.recal.max_refocus_attempts,
                zone_margin: self.recal.zone_margin,
            },
            settle: SettleConfig {
                after_move: Duration::from_millis(self.settle.after_move_ms),
                after_restore: Duration::from_millis(self.settle.after_restore_ms),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ClickRecord {
    pixel: [f64; 2],
    arm_delta: [f64; 3],
    targets: [f64; 3],
}

#[derive(Debug, Serialize)]
struct SimulationOutput {
    ticks: usize,
    matrix: [[f64; 3]; 3],
    inverse: [[f64; 3]; 3],
    max_matrix_error: f64,
    alpha: [[f64; 2]; 2],
    um_px: f64,
    anchor_pixel: [f64; 2],
    click: Option<ClickRecord>,
    recalibrated_anchor_stage: Option<[f64; 3]>,
    requested_settle_ms: u128,
}

#[derive(Debug, Serialize)]
struct LocateOutput {
    found: bool,
    score: f64,
    x: f64,
    y: f64,
}

fn rows3(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    [0, 1, 2].map(|r| [m[(r, 0)], m[(r, 1)], m[(r, 2)]])
}

fn simulate(config: &Config) -> Result<SimulationOutput, Box<dyn std::error::Error>> {
    let mut sim = SimRig::new(config.simulation.to_config());
    let mut calibrator = Calibrator::new(config.calib_config());
    calibrator.begin_calibration();

    let mut ticks = 0;
    while !calibrator.is_calibrated() {
        if ticks >= MAX_TICKS {
            return Err("calibration did not finish".into());
        }
        calibrator.tick(&mut sim.rig())?;
        ticks += 1;
    }
    tracing::info!(ticks, "simulated calibration finished");

    let calibration = calibrator
        .calibration()
        .ok_or("calibration was not committed")?
        .clone();
    let matrix = *calibration.transform.matrix();
    let max_matrix_error = (matrix - config.simulation.jacobian()).amax();

    let click = match config.click {
        Some(pixel) => {
            let target = Point2::new(pixel[0], pixel[1]);
            let planned = calibrator.move_to_pixel(&mut sim.rig(), target)?;
            Some(ClickRecord {
                pixel,
                arm_delta: planned.arm_delta.into(),
                targets: planned.targets.into(),
            })
        }
        None => None,
    };

    let recalibrated_anchor_stage = match config.swap_tip_offset {
        Some(offset) => {
            calibrator.trigger_recalibration(&mut sim.rig())?;
            sim.world_mut().tip_offset = offset.into();
            calibrator.confirm_swap(&mut sim.rig())?;
            let mut done = false;
            for _ in 0..MAX_TICKS {
                if calibrator.tick(&mut sim.rig())? == Progress::Recalibrated {
                    done = true;
                    break;
                }
            }
            if !done {
                return Err("recalibration did not finish".into());
            }
            calibrator.status().anchor.map(|anchor| anchor.stage.into())
        }
        None => None,
    };

    let alpha = calibration.platform.alpha;
    let requested_settle_ms = sim.world().settled.as_millis();
    Ok(SimulationOutput {
        ticks,
        matrix: rows3(&matrix),
        inverse: rows3(calibration.transform.inverse()),
        max_matrix_error,
        alpha: [[alpha[(0, 0)], alpha[(0, 1)]], [alpha[(1, 0)], alpha[(1, 1)]]],
        um_px: calibration.platform.um_px,
        anchor_pixel: [calibration.anchor.pixel.x, calibration.anchor.pixel.y],
        click,
        recalibrated_anchor_stage,
        requested_settle_ms,
    })
}

fn locate(config: &Config) -> Result<LocateOutput, Box<dyn std::error::Error>> {
    if config.image_path.is_empty() || config.template_path.is_empty() {
        return Err("image_path and template_path must be set in the config".into());
    }
    let image = load_gray_image(&config.image_path)?;
    let template_img = load_gray_image(&config.template_path)?;
    let template = Template::from_image(template_img, 0.0);

    let mut matcher = ZnccMatcher::new().with_config(ZnccConfig {
        min_var_i: config.zncc.min_var_i,
        found_threshold: config.zncc.found_threshold,
    });
    let result = matcher.locate(image.view(), &template)?;
    Ok(LocateOutput {
        found: result.found,
        score: result.score,
        x: result.location.x,
        y: result.location.y,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive("tipcal=info".parse()?))
            .with_target(false)
            .init();
    }

    if cli.print_schema {
        println!("{SCHEMA_JSON}");
        return Ok(());
    }
    if cli.print_example {
        println!("{EXAMPLE_JSON}");
        return Ok(());
    }

    let config_text = fs::read_to_string(&cli.config)?;
    let config: Config = serde_json::from_str(&config_text)?;

    let json = match cli.command.unwrap_or(Command::Simulate) {
        Command::Simulate => serde_json::to_string_pretty(&simulate(&config)?)?,
        Command::Locate => serde_json::to_string_pretty(&locate(&config)?)?,
    };

    match config.output_path {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }

    Ok(())
}

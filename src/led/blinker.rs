use anyhow::Result;
use std::time::Duration;

use crate::led::driver::LedDriver;
use crate::model::LedColor;

/// Animation command tree for a single strip.
#[derive(Debug, Clone)]
pub enum Cmd {
    On(Duration),
    Off(Duration),
    Repeat(u32, Box<Cmd>),
    Many(Vec<Cmd>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub lit: bool,
    pub hold: Duration,
}

/// The standard alert animation: a bounded blink cycle.
pub fn blink(iterations: u32, on: Duration, off: Duration) -> Cmd {
    Cmd::Repeat(
        iterations,
        Box::new(Cmd::Many(vec![Cmd::On(on), Cmd::Off(off)])),
    )
}

/// Expands a command tree into the flat step sequence it describes.
pub fn flatten(cmd: &Cmd) -> Vec<Step> {
    let mut steps = Vec::new();
    collect(cmd, &mut steps);
    steps
}

fn collect(cmd: &Cmd, steps: &mut Vec<Step>) {
    match cmd {
        Cmd::On(hold) => steps.push(Step {
            lit: true,
            hold: *hold,
        }),
        Cmd::Off(hold) => steps.push(Step {
            lit: false,
            hold: *hold,
        }),
        Cmd::Repeat(n, inner) => {
            for _ in 0..*n {
                collect(inner, steps);
            }
        }
        Cmd::Many(cmds) => {
            for inner in cmds {
                collect(inner, steps);
            }
        }
    }
}

/// Plays an animation on one strip. `cancelled` is consulted before every
/// step so a token change is observed within one animation step. Returns
/// whether the animation was cancelled.
pub async fn run<F>(
    driver: &mut dyn LedDriver,
    strip: LedColor,
    cmd: &Cmd,
    mut cancelled: F,
) -> Result<bool>
where
    F: FnMut() -> bool,
{
    for step in flatten(cmd) {
        if cancelled() {
            return Ok(true);
        }
        driver.set_strip(strip, step.lit)?;
        tokio::time::sleep(step.hold).await;
    }
    Ok(false)
}

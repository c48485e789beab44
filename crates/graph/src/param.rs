/// A node parameter with an optional linear ramp towards its value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParam {
    value: f32,
    ramp: Option<Ramp>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    from: f32,
    start: f64,
    end: f64,
}

impl AudioParam {
    pub fn new(value: f32) -> Self {
        Self { value, ramp: None }
    }

    /// The value the parameter settles on once any ramp completes.
    pub fn target(&self) -> f32 {
        self.value
    }

    pub fn value_at(&self, time: f64) -> f32 {
        match self.ramp {
            Some(ramp) if time < ramp.end => {
                if time <= ramp.start {
                    return ramp.from;
                }
                let t = ((time - ramp.start) / (ramp.end - ramp.start)) as f32;
                ramp.from + (self.value - ramp.from) * t
            }
            _ => self.value,
        }
    }

    /// Jump to `value`, dropping any scheduled ramp.
    pub fn set_value(&mut self, value: f32) {
        self.value = value;
        self.ramp = None;
    }

    /// Replace any scheduled ramp with one from the value held at `now`
    /// to `target`, arriving at `end`.
    pub fn cancel_and_ramp(&mut self, now: f64, target: f32, end: f64) {
        let from = self.value_at(now);
        self.value = target;
        self.ramp = (end > now && from != target).then_some(Ramp {
            from,
            start: now,
            end,
        });
    }
}

impl Default for AudioParam {
    fn default() -> Self {
        Self::new(1.0)
    }
}

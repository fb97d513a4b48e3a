use machine_e2e::poll::Assertions;

/// An assertion that replays a fixed sequence of outcomes, repeating the
/// last one once the sequence runs out.
pub struct Scripted {
    outcomes: Vec<bool>,
    message: &'static str,
    pub calls: usize,
}

impl Scripted {
    pub fn new(outcomes: &[bool], message: &'static str) -> Self {
        assert!(!outcomes.is_empty(), "a script needs at least one outcome");
        Self {
            outcomes: outcomes.to_vec(),
            message,
            calls: 0,
        }
    }

    pub fn always(outcome: bool, message: &'static str) -> Self {
        Self::new(&[outcome], message)
    }

    /// Record the next outcome in `g`, failing with `"<message> (call n)"`.
    pub fn evaluate(&mut self, g: &Assertions) -> bool {
        let outcome = self
            .outcomes
            .get(self.calls)
            .or(self.outcomes.last())
            .copied()
            .unwrap_or(true);
        self.calls += 1;
        if !outcome {
            g.fail(format!("{} (call {})", self.message, self.calls));
        }
        outcome
    }
}

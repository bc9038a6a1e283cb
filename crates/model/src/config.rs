use candle_core::{Error, Result};

/// Hyperparameters for the cross-modal audio/text classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct MultimodalConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_classes: usize,
    pub only_audio: bool,
    pub only_text: bool,
    /// Width of one audio frame (number of MFCC coefficients).
    pub d_audio_orig: usize,
    /// Width of one text feature vector (BERT hidden size).
    pub d_text_orig: usize,
    pub d_model: usize,
    pub attn_dropout: f32,
    pub relu_dropout: f32,
    pub emb_dropout: f32,
    pub res_dropout: f32,
    pub out_dropout: f32,
    /// Apply key padding masks inside attention.
    pub attn_mask: bool,
}

impl Default for MultimodalConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            n_heads: 2,
            n_classes: 7,
            only_audio: false,
            only_text: false,
            d_audio_orig: 40,
            d_text_orig: 768,
            d_model: 40,
            attn_dropout: 0.3,
            relu_dropout: 0.3,
            emb_dropout: 0.3,
            res_dropout: 0.3,
            out_dropout: 0.3,
            attn_mask: true,
        }
    }
}

impl MultimodalConfig {
    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads.max(1)
    }

    /// Width of the pooled representation fed to the classification head.
    pub fn combined_dim(&self) -> usize {
        if self.only_audio || self.only_text {
            self.d_model
        } else {
            2 * self.d_model
        }
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.only_audio && self.only_text {
            return Err(Error::Msg(
                "only_audio and only_text are mutually exclusive".into(),
            ));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 {
            return Err(Error::Msg("n_heads must be greater than zero".into()));
        }
        if self.n_classes == 0 {
            return Err(Error::Msg("n_classes must be greater than zero".into()));
        }
        if self.d_model == 0 {
            return Err(Error::Msg("d_model must be greater than zero".into()));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }
        if !self.only_text && self.d_audio_orig == 0 {
            return Err(Error::Msg(
                "d_audio_orig must be greater than zero".into(),
            ));
        }
        if !self.only_audio && self.d_text_orig == 0 {
            return Err(Error::Msg("d_text_orig must be greater than zero".into()));
        }
        for (label, p) in [
            ("attn_dropout", self.attn_dropout),
            ("relu_dropout", self.relu_dropout),
            ("emb_dropout", self.emb_dropout),
            ("res_dropout", self.res_dropout),
            ("out_dropout", self.out_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!(
                    "{label} must be in [0, 1) (got {p})"
                )));
            }
        }
        Ok(())
    }
}

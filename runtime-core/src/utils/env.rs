//! `ACCEL_*` environment overrides for `RuntimeConfig`.

use std::env::var;
use std::str::FromStr;
use std::time::Duration;

use crate::config::*;

fn key(key: &str) -> String {
  format!("ACCEL_{}", key)
}

fn b(k: &str) -> Option<bool> {
  var(key(k)).ok().map(|v| v != "0" )
}
fn n<T>(k: &str) -> Option<T>
  where T: FromStr,
{
  let v = var(key(k)).ok()?;
  match v.trim().parse() {
    Ok(v) => Some(v),
    Err(_) => {
      log::warn!("ignoring unparsable {}={:?}", key(k), v);
      None
    },
  }
}

fn aux_mode(v: &str) -> Option<AuxTranslationMode> {
  match v.trim().to_ascii_lowercase().as_str() {
    "none" | "0" => Some(AuxTranslationMode::None),
    "builtin" | "1" => Some(AuxTranslationMode::Builtin),
    "blit" | "2" => Some(AuxTranslationMode::Blit),
    _ => None,
  }
}

pub(crate) fn apply(config: &mut RuntimeConfig) {
  if let Some(v) = n("TOKEN_CHUNK_SIZE") {
    config.token_chunk_size = v;
  }
  if let Some(v) = n("MAX_TOKEN_CHUNKS") {
    config.max_token_chunks = v;
  }
  if let Some(v) = n("PARTITIONS") {
    config.partitions = v;
  }
  if let Some(true) = b("FORCE_FULL_STATE") {
    config.encoder = EncoderKind::FullState;
  }
  if let Some(batched) = b("BATCHED_DISPATCH") {
    config.dispatch_mode = if batched {
      DispatchMode::Batched
    } else {
      DispatchMode::Immediate
    };
  }
  if let Ok(v) = var(key("AUX_TRANSLATION")) {
    match aux_mode(&v) {
      Some(mode) => config.aux_translation = mode,
      None => log::warn!("ignoring unknown {}={:?}", key("AUX_TRANSLATION"), v),
    }
  }
  if let Some(us) = n("POLL_INTERVAL_US") {
    config.poll_interval = Duration::from_micros(us);
  }

  if config.partitions == 0 {
    config.partitions = 1;
  }
  if config.token_chunk_size == 0 {
    config.token_chunk_size = 1;
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn aux_modes() {
    assert_eq!(aux_mode("Blit"), Some(AuxTranslationMode::Blit));
    assert_eq!(aux_mode(" none"), Some(AuxTranslationMode::None));
    assert_eq!(aux_mode("1"), Some(AuxTranslationMode::Builtin));
    assert_eq!(aux_mode("fast"), None);
  }
}

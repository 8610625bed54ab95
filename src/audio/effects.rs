use serde::Serialize;
use std::{fmt::Write as _, time::Duration};
use tracing::debug;

use crate::{
    audio::track::Platform,
    error::{EngineError, Result},
};

/// Valor de un parámetro de filtro
#[derive(Debug, Clone, Copy)]
pub enum Param {
    Fixed(&'static str),
    /// La intensidad del efecto tal cual
    Intensity,
    /// La intensidad multiplicada por un factor
    Scaled(f64),
}

/// Un filtro de ffmpeg; una clave vacía es un argumento posicional
#[derive(Debug, Clone, Copy)]
pub struct Filter {
    pub name: &'static str,
    pub args: &'static [(&'static str, Param)],
}

/// Entrada del registro de efectos
#[derive(Debug, Clone, Copy)]
pub struct EffectSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub default: f64,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub chain: &'static [Filter],
}

const SOXR: Filter = Filter {
    name: "aresample",
    args: &[("resampler", Param::Fixed("soxr"))],
};

const SOXR_HQ: Filter = Filter {
    name: "aresample",
    args: &[
        ("resampler", Param::Fixed("soxr")),
        ("precision", Param::Fixed("28")),
        ("osf", Param::Fixed("s32")),
        ("tsf", Param::Fixed("s32p")),
    ],
};

const RESAMPLE_44K: Filter = Filter {
    name: "aresample",
    args: &[("", Param::Fixed("44100")), ("resampler", Param::Fixed("soxr"))],
};

pub static EFFECTS: &[EffectSpec] = &[
    EffectSpec {
        name: "none",
        label: "Normal",
        default: 0.0,
        min: 0.0,
        max: 0.0,
        step: 0.0,
        chain: &[Filter {
            name: "aresample",
            args: &[
                ("resampler", Param::Fixed("soxr")),
                ("precision", Param::Fixed("28")),
                ("osf", Param::Fixed("s32")),
                ("tsf", Param::Fixed("s32p")),
                ("dither_method", Param::Fixed("triangular_hp")),
                ("filter_size", Param::Fixed("128")),
            ],
        }],
    },
    EffectSpec {
        name: "bassboost",
        label: "Bass Boost",
        default: 15.0,
        min: 5.0,
        max: 50.0,
        step: 5.0,
        chain: &[
            SOXR_HQ,
            Filter {
                name: "equalizer",
                args: &[
                    ("f", Param::Fixed("40")),
                    ("width_type", Param::Fixed("h")),
                    ("width", Param::Fixed("50")),
                    ("g", Param::Intensity),
                ],
            },
        ],
    },
    EffectSpec {
        name: "nightcore",
        label: "Nightcore",
        default: 1.25,
        min: 1.1,
        max: 1.5,
        step: 0.05,
        chain: &[
            Filter {
                name: "asetrate",
                args: &[("", Param::Scaled(44100.0))],
            },
            RESAMPLE_44K,
            Filter {
                name: "atempo",
                args: &[("", Param::Fixed("0.8"))],
            },
        ],
    },
    EffectSpec {
        name: "vaporwave",
        label: "Vaporwave",
        default: 0.8,
        min: 0.5,
        max: 0.9,
        step: 0.05,
        chain: &[
            Filter {
                name: "asetrate",
                args: &[("", Param::Scaled(44100.0))],
            },
            RESAMPLE_44K,
            Filter {
                name: "atempo",
                args: &[("", Param::Fixed("1.25"))],
            },
        ],
    },
    EffectSpec {
        name: "tremolo",
        label: "Tremolo",
        default: 5.0,
        min: 2.0,
        max: 10.0,
        step: 1.0,
        chain: &[
            SOXR,
            Filter {
                name: "tremolo",
                args: &[("f", Param::Intensity), ("d", Param::Fixed("0.7"))],
            },
        ],
    },
    EffectSpec {
        name: "echo",
        label: "Echo",
        default: 40.0,
        min: 20.0,
        max: 100.0,
        step: 10.0,
        chain: &[
            SOXR,
            Filter {
                name: "aecho",
                args: &[
                    ("", Param::Fixed("0.8")),
                    ("", Param::Fixed("0.8")),
                    ("", Param::Intensity),
                    ("", Param::Fixed("0.5")),
                ],
            },
        ],
    },
    EffectSpec {
        name: "radio",
        label: "Radio",
        default: 1.0,
        min: 0.5,
        max: 2.0,
        step: 0.1,
        chain: &[
            SOXR,
            Filter {
                name: "bandpass",
                args: &[
                    ("f", Param::Fixed("1500")),
                    ("width_type", Param::Fixed("h")),
                    ("width", Param::Scaled(1000.0)),
                ],
            },
            Filter {
                name: "dynaudnorm",
                args: &[],
            },
        ],
    },
    EffectSpec {
        name: "concert",
        label: "Concert",
        default: 30.0,
        min: 10.0,
        max: 100.0,
        step: 5.0,
        chain: &[
            SOXR,
            Filter {
                name: "stereotools",
                args: &[
                    ("mlev", Param::Intensity),
                    ("mode", Param::Fixed("8")),
                    ("stereo", Param::Fixed("true")),
                ],
            },
        ],
    },
];

impl EffectSpec {
    pub fn lookup(name: &str) -> Option<&'static EffectSpec> {
        let name = name.to_lowercase();
        EFFECTS.iter().find(|e| e.name == name)
    }

    /// Valida la intensidad pedida o usa la de por defecto
    pub fn settings(&'static self, intensity: Option<f64>) -> Result<EffectSettings> {
        let intensity = match intensity {
            None => self.default,
            Some(_) if self.name == "none" => self.default,
            Some(v) if v.is_finite() && v >= self.min - 1e-9 && v <= self.max + 1e-9 => v,
            Some(v) => {
                return Err(EngineError::invalid(format!(
                    "Intensidad {} fuera de rango para {} ({} - {})",
                    v, self.label, self.min, self.max
                )))
            }
        };

        Ok(EffectSettings {
            name: self.name,
            intensity,
        })
    }
}

/// Efecto activo de un guild
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectSettings {
    pub name: &'static str,
    pub intensity: f64,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            name: "none",
            intensity: 0.0,
        }
    }
}

/// Presets de calidad, aplicados como prefijo de la cadena de filtros
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    #[default]
    Standard,
    Voice,
    Music,
    BassBoost,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 4] = [
        QualityPreset::Standard,
        QualityPreset::Voice,
        QualityPreset::Music,
        QualityPreset::BassBoost,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == raw.to_lowercase())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityPreset::Standard => "standard",
            QualityPreset::Voice => "voice",
            QualityPreset::Music => "music",
            QualityPreset::BassBoost => "bass_boost",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            QualityPreset::Standard => "High-quality general purpose audio",
            QualityPreset::Voice => "Optimized for speech clarity",
            QualityPreset::Music => "Enhanced dynamic range for music",
            QualityPreset::BassBoost => "Enhanced bass response",
        }
    }

    fn filters(&self) -> &'static [Filter] {
        match self {
            QualityPreset::Standard => &[],
            QualityPreset::Voice => &[
                Filter {
                    name: "highpass",
                    args: &[("f", Param::Fixed("80"))],
                },
                Filter {
                    name: "lowpass",
                    args: &[("f", Param::Fixed("8000"))],
                },
                Filter {
                    name: "acompressor",
                    args: &[
                        ("threshold", Param::Fixed("-18dB")),
                        ("ratio", Param::Fixed("3")),
                    ],
                },
            ],
            QualityPreset::Music => &[Filter {
                name: "acompressor",
                args: &[
                    ("threshold", Param::Fixed("-20dB")),
                    ("ratio", Param::Fixed("2")),
                    ("attack", Param::Fixed("20")),
                    ("release", Param::Fixed("250")),
                ],
            }],
            QualityPreset::BassBoost => &[Filter {
                name: "bass",
                args: &[("g", Param::Fixed("6")), ("f", Param::Fixed("100"))],
            }],
        }
    }
}

/// Argumentos para el transcodificador
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FfmpegArgs {
    /// Van antes de `-i`
    pub pre_args: Vec<String>,
    /// Van después de la entrada
    pub filter_args: Vec<String>,
}

/// Construye los argumentos de ffmpeg para un efecto, plataforma y posición
pub fn get_options(
    effect: EffectSettings,
    preset: QualityPreset,
    platform: Platform,
    live: bool,
    seek: Option<Duration>,
) -> Result<FfmpegArgs> {
    let spec = EffectSpec::lookup(effect.name)
        .ok_or_else(|| EngineError::invalid(format!("Efecto desconocido: {}", effect.name)))?;
    let effect = spec.settings(Some(effect.intensity))?;

    let mut pre_args: Vec<String> = [
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        "5",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if live {
        pre_args.extend(
            [
                "-analyzeduration",
                "12000000",
                "-probesize",
                "32000000",
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }
    pre_args.extend(platform_hints(platform, live).iter().map(|s| s.to_string()));

    if let Some(offset) = seek {
        pre_args.push("-ss".to_string());
        pre_args.push(format!("{:.3}", offset.as_secs_f64()));
    }

    let chain = render_chain(preset.filters().iter().chain(spec.chain), effect.intensity);
    debug!("🎛️ Cadena de filtros ({}): {}", spec.name, chain);

    let filter_args = ["-vn", "-af", chain.as_str(), "-ac", "2", "-ar", "48000"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    Ok(FfmpegArgs {
        pre_args,
        filter_args,
    })
}

fn platform_hints(platform: Platform, live: bool) -> &'static [&'static str] {
    match (platform, live) {
        (Platform::Twitch, true) => &["-timeout", "10000000", "-live_start_index", "-1"],
        (Platform::YouTube, _) => &["-reconnect_on_network_error", "1"],
        (Platform::SoundCloud, false) => &["-reconnect_at_eof", "1"],
        _ => &[],
    }
}

/// Renderiza una cadena de filtros al formato de `-af`
fn render_chain<'a>(filters: impl Iterator<Item = &'a Filter>, intensity: f64) -> String {
    let mut out = String::new();

    for filter in filters {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(filter.name);

        for (i, (key, param)) in filter.args.iter().enumerate() {
            out.push(if i == 0 { '=' } else { ':' });
            if !key.is_empty() {
                let _ = write!(out, "{}=", key);
            }
            match param {
                Param::Fixed(v) => out.push_str(v),
                Param::Intensity => out.push_str(&format_number(intensity)),
                Param::Scaled(factor) => out.push_str(&format_number(intensity * factor)),
            }
        }
    }

    out
}

fn format_number(value: f64) -> String {
    let rounded = value.round();
    if (value - rounded).abs() < 1e-6 {
        format!("{}", rounded as i64)
    } else {
        let s = format!("{:.3}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings(name: &str, intensity: Option<f64>) -> EffectSettings {
        EffectSpec::lookup(name).unwrap().settings(intensity).unwrap()
    }

    fn chain_of(args: &FfmpegArgs) -> &str {
        let i = args.filter_args.iter().position(|a| a == "-af").unwrap();
        &args.filter_args[i + 1]
    }

    #[test]
    fn none_applies_hq_resample_only() {
        let args = get_options(
            EffectSettings::default(),
            QualityPreset::Standard,
            Platform::Other,
            false,
            None,
        )
        .unwrap();

        assert_eq!(
            chain_of(&args),
            "aresample=resampler=soxr:precision=28:osf=s32:tsf=s32p:dither_method=triangular_hp:filter_size=128"
        );
        assert_eq!(
            args.pre_args,
            vec!["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "5"]
        );
        assert_eq!(&args.filter_args[args.filter_args.len() - 4..], ["-ac", "2", "-ar", "48000"]);
    }

    #[test]
    fn renders_intensity_parameters() {
        let args = get_options(
            settings("nightcore", Some(1.3)),
            QualityPreset::Standard,
            Platform::Other,
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            chain_of(&args),
            "asetrate=57330,aresample=44100:resampler=soxr,atempo=0.8"
        );

        let args = get_options(
            settings("echo", None),
            QualityPreset::Standard,
            Platform::Other,
            false,
            None,
        )
        .unwrap();
        assert_eq!(chain_of(&args), "aresample=resampler=soxr,aecho=0.8:0.8:40:0.5");

        let args = get_options(
            settings("radio", Some(1.5)),
            QualityPreset::Standard,
            Platform::Other,
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            chain_of(&args),
            "aresample=resampler=soxr,bandpass=f=1500:width_type=h:width=1500,dynaudnorm"
        );
    }

    #[test]
    fn rejects_out_of_range_intensity() {
        let spec = EffectSpec::lookup("bassboost").unwrap();
        assert!(matches!(
            spec.settings(Some(60.0)),
            Err(EngineError::InvalidCommand(_))
        ));
        assert!(spec.settings(Some(50.0)).is_ok());
        assert!(EffectSpec::lookup("chipmunk").is_none());
    }

    #[test]
    fn seek_goes_before_input() {
        let args = get_options(
            EffectSettings::default(),
            QualityPreset::Standard,
            Platform::Other,
            false,
            Some(Duration::from_millis(42_500)),
        )
        .unwrap();
        assert_eq!(&args.pre_args[args.pre_args.len() - 2..], ["-ss", "42.500"]);
    }

    #[test]
    fn live_twitch_gets_stream_hints() {
        let args = get_options(
            EffectSettings::default(),
            QualityPreset::Standard,
            Platform::Twitch,
            true,
            None,
        )
        .unwrap();
        assert!(args.pre_args.contains(&"-analyzeduration".to_string()));
        assert!(args.pre_args.contains(&"-timeout".to_string()));
        assert!(!args.pre_args.contains(&"-ss".to_string()));
    }

    #[test]
    fn preset_prefixes_effect_chain() {
        let args = get_options(
            settings("tremolo", Some(4.0)),
            QualityPreset::BassBoost,
            Platform::Other,
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            chain_of(&args),
            "bass=g=6:f=100,aresample=resampler=soxr,tremolo=f=4:d=0.7"
        );
        assert_eq!(QualityPreset::parse("VOICE"), Some(QualityPreset::Voice));
        assert_eq!(QualityPreset::parse("loud"), None);
    }
}

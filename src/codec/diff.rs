//! Differential decoders.
//!
//! The generic `diff` codec emits the modular difference between
//! consecutive symbols (or its inverse with `sign`). The `pi-m-psk`
//! variant decodes π/m-mPSK: same differential core, but the output
//! drops the constant rotation bit, so its symbols are one bit narrower
//! than the input.

use crate::{
    codec::{
        Codec,
        CodecClass,
        CodecDirection,
        CodecRegistry,
        Error,
        Symbol,
    },
    config::{
        Config,
        FieldType,
    },
};

pub struct DiffCodec {
    config: Config,
    bits_per_symbol: u32,
    mask: u8,
    invert: bool,
    /// drop the π/m rotation bit from every output symbol
    narrow: bool,
    direction: CodecDirection,
    previous: Option<Symbol>,
}

impl DiffCodec {
    fn new(
        bits_per_symbol: u32,
        direction: CodecDirection,
        config: &Config,
        narrow: bool,
    ) -> Result<Box<dyn Codec>, Error> {
        if bits_per_symbol == 0 || bits_per_symbol > 8 {
            return Err(Error::BadConfig);
        }
        if narrow && bits_per_symbol < 2 {
            return Err(Error::BadConfig);
        }
        if narrow && direction == CodecDirection::Forwards {
            return Err(Error::BadDirection);
        }

        let invert = config.get_bool("sign").unwrap_or(false);

        Ok(Box::new(Self {
            config: config.clone(),
            bits_per_symbol,
            mask: ((1u16 << bits_per_symbol) - 1) as u8,
            invert,
            narrow,
            direction,
            previous: None,
        }))
    }

    fn config_template() -> Config {
        let mut config = Config::new("diff").with_field("sign", FieldType::Bool, false);
        let _ = config.set_bool("sign", false);
        config
    }

    fn step(&mut self, symbol: Symbol) -> Option<Symbol> {
        let symbol = symbol & self.mask;

        let out = match self.direction {
            CodecDirection::Backwards => {
                // decode: difference against the previous received symbol
                let previous = self.previous?;
                let diff = symbol.wrapping_sub(previous) & self.mask;
                if self.invert {
                    previous.wrapping_sub(symbol) & self.mask
                }
                else {
                    diff
                }
            }
            CodecDirection::Forwards => {
                // encode: accumulate differences
                let previous = self.previous.unwrap_or(0);
                if self.invert {
                    previous.wrapping_sub(symbol) & self.mask
                }
                else {
                    previous.wrapping_add(symbol) & self.mask
                }
            }
        };

        Some(out)
    }
}

impl Codec for DiffCodec {
    fn config(&self) -> &Config {
        &self.config
    }

    fn output_bits_per_symbol(&self) -> u32 {
        if self.narrow {
            self.bits_per_symbol - 1
        }
        else {
            self.bits_per_symbol
        }
    }

    fn process(&mut self, input: &[Symbol], out: &mut Vec<Symbol>) -> Result<usize, Error> {
        for &symbol in input {
            let emitted = self.step(symbol);

            let stored = match self.direction {
                CodecDirection::Backwards => symbol & self.mask,
                CodecDirection::Forwards => emitted.unwrap_or(symbol & self.mask),
            };
            self.previous = Some(stored);

            if let Some(mut value) = emitted {
                if self.narrow {
                    value >>= 1;
                }
                out.push(value);
            }
        }

        Ok(input.len())
    }
}

pub fn register_builtin_codecs(registry: &mut CodecRegistry) {
    registry.register(CodecClass {
        name: "diff",
        description: "Generic differential codec",
        config_template: DiffCodec::config_template,
        ctor: |bits, direction, config| DiffCodec::new(bits, direction, config, false),
    });

    registry.register(CodecClass {
        name: "pi-m-psk",
        description: "pi/m-mPSK differential decoder",
        config_template: DiffCodec::config_template,
        ctor: |bits, direction, config| DiffCodec::new(bits, direction, config, true),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(bits: u32, invert: bool, narrow: bool) -> Box<dyn Codec> {
        let mut config = DiffCodec::config_template();
        config.set_bool("sign", invert).unwrap();
        DiffCodec::new(bits, CodecDirection::Backwards, &config, narrow).unwrap()
    }

    #[test]
    fn backwards_decodes_differences() {
        let mut codec = decoder(2, false, false);
        let mut out = Vec::new();
        // symbols 0,1,3,3,0 → diffs 1,2,0,1 (mod 4)
        codec.process(&[0, 1, 3, 3, 0], &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 0, 1]);
    }

    #[test]
    fn invert_negates_the_difference() {
        let mut codec = decoder(2, true, false);
        let mut out = Vec::new();
        codec.process(&[0, 1, 3, 3, 0], &mut out).unwrap();
        assert_eq!(out, vec![3, 2, 0, 3]);
    }

    #[test]
    fn encode_then_decode_is_identity() {
        let data = [1u8, 3, 0, 2, 2, 1, 0, 3];

        let config = DiffCodec::config_template();
        let mut encoder =
            DiffCodec::new(2, CodecDirection::Forwards, &config, false).unwrap();
        let mut encoded = Vec::new();
        encoder.process(&data, &mut encoded).unwrap();

        let mut decoder = decoder(2, false, false);
        let mut decoded = Vec::new();
        decoder.process(&encoded, &mut decoded).unwrap();

        // the decoder has no reference for the first encoded symbol
        assert_eq!(decoded, data[1..encoded.len()].to_vec());
    }

    #[test]
    fn pi_m_psk_output_is_one_bit_narrower() {
        let mut codec = decoder(2, false, true);
        assert_eq!(codec.output_bits_per_symbol(), 1);

        let mut out = Vec::new();
        codec.process(&[0, 1, 3, 2], &mut out).unwrap();
        // diffs 1,2,3 → dropped rotation bit → 0,1,1
        assert_eq!(out, vec![0, 1, 1]);
    }

    #[test]
    fn pi_m_psk_rejects_single_bit_symbols() {
        let config = DiffCodec::config_template();
        assert!(DiffCodec::new(1, CodecDirection::Backwards, &config, true).is_err());
    }
}

// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Incremental construction of a [`DeviceConfig`].
//!
//! Every `add_*` call checks its own arguments against the device limits and
//! rejects duplicate names. Cross references are checked once, in [`ConfigBuilder::build`].

use indexmap::IndexMap;
use indexmap::map::Entry;
use nmr_units::duration::Nanoseconds;

use crate::device_config::{
    AnalogInput, AnalogOutput, Controller, DeviceConfig, DigitalOutput, DigitalWaveform, Element,
    FrontEndModule, IntegrationWeights, Pulse, Waveform, check_intermediate_frequency,
    check_pulse_length, check_waveform,
};
use crate::device_traits::{DeviceTraits, OPX1000_LF_TRAITS};
use crate::{Error, Result};

pub struct ConfigBuilder {
    traits: &'static DeviceTraits,
    config: DeviceConfig,
}

fn insert_unique<V>(
    map: &mut IndexMap<String, V>,
    kind: &'static str,
    name: &str,
    value: V,
) -> Result<()> {
    match map.entry(name.to_string()) {
        Entry::Occupied(_) => Err(Error::Duplicate {
            kind,
            name: name.to_string(),
        }),
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
    }
}

impl ConfigBuilder {
    pub fn new(host: &str, port: u16, cluster: &str) -> Self {
        Self::with_traits(host, port, cluster, &OPX1000_LF_TRAITS)
    }

    pub fn with_traits(
        host: &str,
        port: u16,
        cluster: &str,
        traits: &'static DeviceTraits,
    ) -> Self {
        ConfigBuilder {
            traits,
            config: DeviceConfig {
                host: host.to_string(),
                port,
                cluster: cluster.to_string(),
                controllers: IndexMap::new(),
                elements: IndexMap::new(),
                pulses: IndexMap::new(),
                waveforms: IndexMap::new(),
                digital_waveforms: IndexMap::new(),
                integration_weights: IndexMap::new(),
            },
        }
    }

    pub fn traits(&self) -> &'static DeviceTraits {
        self.traits
    }

    pub fn add_controller(&mut self, name: &str) -> Result<&mut Self> {
        let controller = Controller {
            model: self.traits.model.to_string(),
            modules: IndexMap::new(),
        };
        insert_unique(&mut self.config.controllers, "controller", name, controller)?;
        Ok(self)
    }

    pub fn add_module(&mut self, controller: &str, slot: u8) -> Result<&mut Self> {
        if !self.traits.chassis_slots.contains(&slot) {
            return Err(Error::invalid(
                format!("controllers.{controller}.modules.{slot}"),
                format!("chassis slot outside {:?}", self.traits.chassis_slots),
            ));
        }
        let kind = self.traits.module_kind;
        let modules = &mut self.controller_mut(controller)?.modules;
        if modules.contains_key(&slot) {
            return Err(Error::Duplicate {
                kind: "module",
                name: format!("{controller}/{slot}"),
            });
        }
        modules.insert(slot, FrontEndModule::new(kind));
        Ok(self)
    }

    fn controller_mut(&mut self, controller: &str) -> Result<&mut Controller> {
        self.config
            .controllers
            .get_mut(controller)
            .ok_or_else(|| Error::Undefined {
                kind: "controller",
                name: controller.to_string(),
                referenced_by: "builder".to_string(),
            })
    }

    fn module_mut(&mut self, controller: &str, slot: u8) -> Result<&mut FrontEndModule> {
        self.controller_mut(controller)?
            .modules
            .get_mut(&slot)
            .ok_or_else(|| Error::Undefined {
                kind: "module",
                name: format!("{controller}/{slot}"),
                referenced_by: "builder".to_string(),
            })
    }

    fn check_port_range(
        &self,
        field: String,
        port: u8,
        range: &std::ops::RangeInclusive<u8>,
    ) -> Result<()> {
        if range.contains(&port) {
            Ok(())
        } else {
            Err(Error::invalid(field, format!("port {port} outside {range:?}")))
        }
    }

    pub fn add_analog_output(
        &mut self,
        controller: &str,
        slot: u8,
        port: u8,
        offset: f64,
    ) -> Result<&mut Self> {
        let field = format!("controllers.{controller}.modules.{slot}.analog_outputs.{port}");
        self.check_port_range(field.clone(), port, &self.traits.analog_outputs)?;
        let outputs = &mut self.module_mut(controller, slot)?.analog_outputs;
        if outputs.insert(port, AnalogOutput { offset }).is_some() {
            return Err(Error::Duplicate {
                kind: "analog output",
                name: field,
            });
        }
        Ok(self)
    }

    pub fn add_analog_input(
        &mut self,
        controller: &str,
        slot: u8,
        port: u8,
        gain_db: i8,
    ) -> Result<&mut Self> {
        let field = format!("controllers.{controller}.modules.{slot}.analog_inputs.{port}");
        self.check_port_range(field.clone(), port, &self.traits.analog_inputs)?;
        if !self.traits.input_gain_db.contains(&gain_db) {
            return Err(Error::invalid(
                format!("{field}.gain_db"),
                format!("gain {gain_db} dB outside {:?}", self.traits.input_gain_db),
            ));
        }
        let inputs = &mut self.module_mut(controller, slot)?.analog_inputs;
        if inputs.insert(port, AnalogInput { offset: 0.0, gain_db }).is_some() {
            return Err(Error::Duplicate {
                kind: "analog input",
                name: field,
            });
        }
        Ok(self)
    }

    pub fn add_digital_output(
        &mut self,
        controller: &str,
        slot: u8,
        port: u8,
        name: &str,
        inverted: bool,
    ) -> Result<&mut Self> {
        let field = format!("controllers.{controller}.modules.{slot}.digital_outputs.{port}");
        self.check_port_range(field.clone(), port, &self.traits.digital_outputs)?;
        let outputs = &mut self.module_mut(controller, slot)?.digital_outputs;
        let output = DigitalOutput {
            name: name.to_string(),
            inverted,
        };
        if outputs.insert(port, output).is_some() {
            return Err(Error::Duplicate {
                kind: "digital output",
                name: field,
            });
        }
        Ok(self)
    }

    pub fn add_element(&mut self, name: &str, element: Element) -> Result<&mut Self> {
        check_intermediate_frequency(
            &format!("elements.{name}.intermediate_frequency"),
            element.intermediate_frequency,
            self.traits,
        )?;
        insert_unique(&mut self.config.elements, "element", name, element)?;
        Ok(self)
    }

    pub fn add_pulse(&mut self, name: &str, pulse: Pulse) -> Result<&mut Self> {
        check_pulse_length(&format!("pulses.{name}.length"), pulse.length, self.traits)?;
        insert_unique(&mut self.config.pulses, "pulse", name, pulse)?;
        Ok(self)
    }

    pub fn add_waveform(&mut self, name: &str, waveform: Waveform) -> Result<&mut Self> {
        check_waveform(&format!("waveforms.{name}"), &waveform, self.traits)?;
        insert_unique(&mut self.config.waveforms, "waveform", name, waveform)?;
        Ok(self)
    }

    pub fn add_digital_waveform(
        &mut self,
        name: &str,
        state: u8,
        length_ns: u32,
    ) -> Result<&mut Self> {
        if state > 1 {
            return Err(Error::invalid(
                format!("digital_waveforms.{name}"),
                format!("state must be 0 or 1, got {state}"),
            ));
        }
        let waveform = DigitalWaveform {
            samples: vec![(state, length_ns)],
        };
        insert_unique(&mut self.config.digital_waveforms, "digital waveform", name, waveform)?;
        Ok(self)
    }

    pub fn add_integration_weights(
        &mut self,
        name: &str,
        length: Nanoseconds,
        real: f64,
        imag: f64,
    ) -> Result<&mut Self> {
        let field = format!("integration_weights.{name}");
        check_pulse_length(&field, length, self.traits)?;
        if !(real.is_finite() && imag.is_finite()) {
            return Err(Error::invalid(field, "weights must be finite"));
        }
        let weights = IntegrationWeights::constant(real, imag, length.value().round() as u32);
        insert_unique(&mut self.config.integration_weights, "integration weights", name, weights)?;
        Ok(self)
    }

    /// Checks cross references and returns the finished configuration.
    pub fn build(self) -> Result<DeviceConfig> {
        self.config.validate(self.traits)?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_config::PortRef;
    use nmr_units::duration::nanoseconds;
    use nmr_units::frequency::megahertz;

    fn base() -> ConfigBuilder {
        let mut builder = ConfigBuilder::new("127.0.0.1", 80, "test");
        builder
            .add_controller("con1")
            .unwrap()
            .add_module("con1", 1)
            .unwrap()
            .add_analog_output("con1", 1, 2, 0.0)
            .unwrap()
            .add_analog_input("con1", 1, 2, 16)
            .unwrap();
        builder
    }

    fn element(operations: &[(&str, &str)]) -> Element {
        Element {
            intermediate_frequency: megahertz(282.0),
            output: PortRef::new("con1", 1, 2),
            input: Some(PortRef::new("con1", 1, 2)),
            digital_inputs: IndexMap::new(),
            operations: operations
                .iter()
                .map(|(op, pulse)| (op.to_string(), pulse.to_string()))
                .collect(),
            time_of_flight: Some(nanoseconds(280.0)),
            sticky: false,
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut builder = base();
        builder.add_element("resonator", element(&[])).unwrap();
        let err = builder.add_element("resonator", element(&[])).err().unwrap();
        assert!(matches!(err, Error::Duplicate { kind: "element", .. }));
        assert!(builder.add_controller("con1").is_err());
        assert!(builder.add_analog_output("con1", 1, 2, 0.0).is_err());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut builder = base();
        let err = builder.add_analog_output("con1", 1, 9, 0.0).err().unwrap();
        assert_eq!(err.field(), Some("controllers.con1.modules.1.analog_outputs.9"));
        assert!(builder.add_analog_input("con1", 1, 1, 40).is_err());
        assert!(builder.add_module("con1", 0).is_err());

        let mut fast = element(&[]);
        fast.intermediate_frequency = megahertz(800.0);
        let err = builder.add_element("fast", fast).err().unwrap();
        assert_eq!(err.field(), Some("elements.fast.intermediate_frequency"));

        let err = builder
            .add_pulse("odd", Pulse::control(nanoseconds(1101.0), "wf"))
            .err()
            .unwrap();
        assert_eq!(err.field(), Some("pulses.odd.length"));

        let err = builder
            .add_waveform("loud", Waveform::Constant { sample: 0.6 })
            .err()
            .unwrap();
        assert_eq!(err.field(), Some("waveforms.loud"));
    }

    #[test]
    fn test_undefined_references_rejected() {
        let mut builder = base();
        builder
            .add_element("resonator", element(&[("cw", "const_pulse")]))
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(
            matches!(err, Error::Undefined { kind: "pulse", ref name, .. } if name == "const_pulse")
        );
    }

    #[test]
    fn test_waveform_shape_must_match() {
        let mut builder = base();
        builder
            .add_element("resonator", element(&[("shaped", "shaped_pulse")]))
            .unwrap()
            .add_pulse("shaped_pulse", Pulse::control(nanoseconds(100.0), "shaped_wf"))
            .unwrap()
            .add_waveform(
                "shaped_wf",
                Waveform::Arbitrary {
                    samples: vec![0.1; 96],
                },
            )
            .unwrap();
        let err = builder.build().unwrap_err();
        assert_eq!(err.field(), Some("pulses.shaped_pulse.waveform"));
    }

    #[test]
    fn test_measurement_weights_must_match_length() {
        let mut builder = base();
        builder
            .add_element("resonator", element(&[("readout", "readout_pulse")]))
            .unwrap()
            .add_pulse(
                "readout_pulse",
                Pulse::measurement(nanoseconds(4000.0), "zero_wf").with_weights("cos", "short"),
            )
            .unwrap()
            .add_waveform("zero_wf", Waveform::Constant { sample: 0.0 })
            .unwrap()
            .add_integration_weights("short", nanoseconds(2000.0), 1.0, 0.0)
            .unwrap();
        let err = builder.build().unwrap_err();
        assert_eq!(err.field(), Some("pulses.readout_pulse.integration_weights.cos"));
    }
}

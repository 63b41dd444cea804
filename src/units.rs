//! Physical unit conversions used across the beamline.

/// Planck constant in eV·s
pub const PLANCK_EV_S: f64 = 4.135_667_33e-15;
/// Speed of light in Å/s
pub const SPEED_OF_LIGHT_A_S: f64 = 299_792_458e10;
/// Si(111) lattice constant at LN2 temperature, in Å
pub const SI111_LATTICE_A: f64 = 5.429_757_5;

/// Photon energy (keV) to wavelength (Å)
pub fn kev_to_angstrom(energy: f64) -> f64 {
    (PLANCK_EV_S * SPEED_OF_LIGHT_A_S) / (energy * 1000.0)
}

/// Wavelength (Å) to photon energy (keV)
pub fn angstrom_to_kev(wavelength: f64) -> f64 {
    (PLANCK_EV_S * SPEED_OF_LIGHT_A_S) / (wavelength * 1000.0)
}

fn si111_spacing() -> f64 {
    SI111_LATTICE_A / 3.0_f64.sqrt()
}

/// Monochromator Bragg angle (degrees) to energy (keV)
pub fn bragg_to_kev(bragg: f64) -> f64 {
    let wavelength = 2.0 * si111_spacing() * bragg.to_radians().sin();
    angstrom_to_kev(wavelength)
}

/// Energy (keV) to monochromator Bragg angle (degrees)
pub fn kev_to_bragg(energy: f64) -> f64 {
    (kev_to_angstrom(energy) / (2.0 * si111_spacing()))
        .asin()
        .to_degrees()
}
